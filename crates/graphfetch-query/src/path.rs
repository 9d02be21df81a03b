//! Navigation paths.
//!
//! A navigation path is a chain of reference and collection fields starting
//! at a root type, written as dotted field names. A collection step may carry
//! an item limit in brackets:
//!
//! ```text
//! orders[10].lines.product
//! ```

use graphfetch_core::{Error, FieldId, FieldInfo, ModelRegistry, Result, TypeId};
use std::fmt;

/// One step of a [`NavigationPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub field: FieldId,
    /// Type the field was resolved on.
    pub owner: TypeId,
    /// Type the step navigates to.
    pub target: TypeId,
    pub is_collection: bool,
    pub item_limit: Option<usize>,
}

/// A compiled chain of navigation fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationPath {
    root: TypeId,
    steps: Vec<PathStep>,
    text: String,
}

fn step_for(owner: TypeId, field: &FieldInfo, item_limit: Option<usize>) -> Result<PathStep> {
    let (target, is_collection) = if let Some(target) = field.reference_target() {
        (target, false)
    } else if let Some(assoc) = field.association() {
        (assoc.target, true)
    } else {
        return Err(Error::unknown_field(format!(
            "'{}' is not a navigation field",
            field.name
        )));
    };
    if item_limit.is_some() && !is_collection {
        return Err(Error::unknown_field(format!(
            "item limit on reference field '{}'",
            field.name
        )));
    }
    Ok(PathStep {
        field: field.id,
        owner,
        target,
        is_collection,
        item_limit,
    })
}

fn parse_segment(segment: &str) -> Result<(&str, Option<usize>)> {
    let segment = segment.trim();
    let Some(open) = segment.find('[') else {
        return Ok((segment, None));
    };
    let limit = segment[open + 1..]
        .strip_suffix(']')
        .and_then(|n| n.trim().parse::<usize>().ok())
        .ok_or_else(|| Error::unknown_field(format!("malformed path segment '{segment}'")))?;
    Ok((segment[..open].trim_end(), Some(limit)))
}

impl NavigationPath {
    /// Compile a dotted path of field names starting at `root`.
    pub fn parse(model: &ModelRegistry, root: TypeId, path: &str) -> Result<Self> {
        let mut current = root;
        let mut steps = Vec::new();
        for segment in path.split('.') {
            let (name, limit) = parse_segment(segment)?;
            let info = model.require_type(current)?;
            let field = info.field_by_name(name).ok_or_else(|| {
                Error::unknown_field(format!("'{}' has no field '{name}'", info.name))
            })?;
            let step = step_for(current, field, limit)?;
            current = step.target;
            steps.push(step);
        }
        Ok(Self {
            root,
            steps,
            text: path.to_string(),
        })
    }

    /// Compile a chain of field ids starting at `root`.
    pub fn from_fields(model: &ModelRegistry, root: TypeId, fields: &[FieldId]) -> Result<Self> {
        let mut current = root;
        let mut steps = Vec::with_capacity(fields.len());
        let mut names = Vec::with_capacity(fields.len());
        for id in fields {
            let field = model.resolve_field(current, *id).ok_or_else(|| {
                Error::unknown_field(format!(
                    "field {:?} is not declared on '{}'",
                    id,
                    model.type_name(current)
                ))
            })?;
            let step = step_for(current, field, None)?;
            names.push(field.name.clone());
            current = step.target;
            steps.push(step);
        }
        Ok(Self {
            root,
            steps,
            text: names.join("."),
        })
    }

    /// Set the item limit of the last step, which must be a collection.
    pub fn with_limit(mut self, limit: usize) -> Result<Self> {
        match self.steps.last_mut() {
            Some(step) if step.is_collection => {
                step.item_limit = Some(limit);
                self.text = format!("{}[{limit}]", self.text);
                Ok(self)
            }
            _ => Err(Error::unknown_field(format!(
                "path '{}' does not end in a collection",
                self.text
            ))),
        }
    }

    pub fn root(&self) -> TypeId {
        self.root
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for NavigationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
