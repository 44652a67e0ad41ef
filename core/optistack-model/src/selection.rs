//! Statically declared result shapes.
//!
//! A [`Selection`] lists the fields a view needs. Documents are assembled in
//! code with builder methods; conditional fields carry an `@include`/`@skip`
//! [`Directive`] bound to an operation variable, and reusable [`Fragment`]s
//! are spread into selections by reference.

use serde_json::Value;
use std::sync::Arc;

/// Conditional inclusion of a field, evaluated against operation variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `@include(if: $var)`: keep the field only when the variable is `true`.
    Include(String),
    /// `@skip(if: $var)`: drop the field when the variable is `true`.
    Skip(String),
}

impl Directive {
    /// Whether a field carrying this directive is part of the result.
    /// A missing or non-boolean variable counts as `false`.
    pub fn is_active(&self, variables: &Value) -> bool {
        let flag = |name: &str| variables.get(name).and_then(Value::as_bool).unwrap_or(false);
        match self {
            Self::Include(var) => flag(var),
            Self::Skip(var) => !flag(var),
        }
    }
}

/// One selected field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSelection {
    pub name: String,
    pub alias: Option<String>,
    /// Sub-selection for object, reference and list fields. `None` selects
    /// the whole stored value.
    pub selection: Option<Selection>,
    pub directive: Option<Directive>,
}

impl FieldSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            selection: None,
            directive: None,
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn select(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    #[must_use]
    pub fn include_if(mut self, variable: impl Into<String>) -> Self {
        self.directive = Some(Directive::Include(variable.into()));
        self
    }

    #[must_use]
    pub fn skip_if(mut self, variable: impl Into<String>) -> Self {
        self.directive = Some(Directive::Skip(variable.into()));
        self
    }

    /// Key under which the field appears in a materialized result.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn is_active(&self, variables: &Value) -> bool {
        self.directive.as_ref().is_none_or(|d| d.is_active(variables))
    }
}

/// Item of a selection set.
#[derive(Debug, Clone, PartialEq)]
pub enum Selected {
    Field(FieldSelection),
    Fragment(Arc<Fragment>),
}

/// An ordered selection set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub items: Vec<Selected>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selection of plain scalar fields.
    pub fn fields<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().fold(Self::new(), Self::field)
    }

    /// Adds a plain field.
    #[must_use]
    pub fn field(self, name: &str) -> Self {
        self.with(FieldSelection::new(name))
    }

    /// Adds a field with a sub-selection.
    #[must_use]
    pub fn nested(self, name: &str, selection: Selection) -> Self {
        self.with(FieldSelection::new(name).select(selection))
    }

    /// Adds a fully configured field.
    #[must_use]
    pub fn with(mut self, field: FieldSelection) -> Self {
        self.items.push(Selected::Field(field));
        self
    }

    /// Spreads a fragment.
    #[must_use]
    pub fn spread(mut self, fragment: Arc<Fragment>) -> Self {
        self.items.push(Selected::Fragment(fragment));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Reusable selection applying to entities of one type.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub name: String,
    pub type_condition: String,
    pub selection: Selection,
}

impl Fragment {
    pub fn new(name: impl Into<String>, type_condition: impl Into<String>, selection: Selection) -> Self {
        Self {
            name: name.into(),
            type_condition: type_condition.into(),
            selection,
        }
    }

    /// Whether the fragment applies to an object of `typename`. Objects of
    /// unknown type accept every fragment.
    pub fn applies_to(&self, typename: Option<&str>) -> bool {
        typename.is_none_or(|t| t == self.type_condition)
    }
}

/// A named query: the operation name sent to the transport plus the shape
/// of its root fields.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDocument {
    pub name: String,
    pub selection: Selection,
}

impl QueryDocument {
    pub fn new(name: impl Into<String>, selection: Selection) -> Self {
        Self {
            name: name.into(),
            selection,
        }
    }
}
