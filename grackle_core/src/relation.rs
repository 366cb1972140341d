//! Cross-element relations: one element observing a property of another.
//!
//! A relation names an `of` element (the one whose property is observed) and
//! a `from` element (the one that receives the derived value when
//! generating). Relations are declared with element names during tree
//! construction and resolved to element ids in a single explicit
//! [`bind_relations`](crate::model::DataModel::bind_relations) pass, which
//! also records the of→from dependency edges that invalidation follows.

use crate::element::ElementId;
use crate::model::ModelError;

/// The four relation kinds. An element carries at most one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Byte length of the observed element's generated value.
    Size,
    /// Number of live children of the observed array.
    Count,
    /// Byte position of the observed element in the output.
    Offset,
    /// Scripted presence condition gating the owner's contribution.
    When,
}

/// A single relation, as declared on its owning element.
#[derive(Debug, Clone)]
pub struct Relation {
    pub kind: RelationKind,
    /// Name of the observed element; `None` means the owner itself (When).
    pub(crate) of_name: Option<String>,
    /// Explicit receiver name; defaults to the owner at bind time.
    pub(crate) from_name: Option<String>,
    pub(crate) of: Option<ElementId>,
    pub(crate) from: Option<ElementId>,
    /// Post-processes the observed value when generating.
    pub expression_get: Option<String>,
    /// Pre-processes an externally supplied value when consuming.
    pub expression_set: Option<String>,
    /// Offset only: measure from an anchor instead of the document start.
    pub is_relative: bool,
    pub(crate) relative_to: Option<String>,
    pub(crate) relative_to_id: Option<ElementId>,
    /// When only: the presence condition.
    pub when_expression: Option<String>,
}

impl Relation {
    fn new(kind: RelationKind, of_name: Option<String>) -> Self {
        Self {
            kind,
            of_name,
            from_name: None,
            of: None,
            from: None,
            expression_get: None,
            expression_set: None,
            is_relative: false,
            relative_to: None,
            relative_to_id: None,
            when_expression: None,
        }
    }

    /// A Size relation observing the element named `of`.
    pub fn size_of(of: &str) -> Self {
        Self::new(RelationKind::Size, Some(of.to_string()))
    }

    /// A Count relation observing the array named `of`.
    pub fn count_of(of: &str) -> Self {
        Self::new(RelationKind::Count, Some(of.to_string()))
    }

    /// An Offset relation observing the element named `of`.
    pub fn offset_of(of: &str) -> Self {
        Self::new(RelationKind::Offset, Some(of.to_string()))
    }

    /// A When relation gating the owning element on `expression`.
    pub fn when(expression: &str) -> Self {
        let mut rel = Self::new(RelationKind::When, None);
        rel.when_expression = Some(expression.to_string());
        rel
    }

    /// Names the element that receives the derived value (default: the owner).
    pub fn from(mut self, name: &str) -> Self {
        self.from_name = Some(name.to_string());
        self
    }

    pub fn expression_get(mut self, expression: &str) -> Self {
        self.expression_get = Some(expression.to_string());
        self
    }

    pub fn expression_set(mut self, expression: &str) -> Self {
        self.expression_set = Some(expression.to_string());
        self
    }

    /// Offset only: measure relative to the owner's parent container.
    pub fn relative(mut self) -> Self {
        self.is_relative = true;
        self
    }

    /// Offset only: measure relative to the named anchor element.
    pub fn relative_to(mut self, name: &str) -> Self {
        self.is_relative = true;
        self.relative_to = Some(name.to_string());
        self
    }

    /// The resolved observed element, once bound.
    pub fn of(&self) -> Option<ElementId> {
        self.of
    }

    /// The resolved receiver element, once bound.
    pub fn from_element(&self) -> Option<ElementId> {
        self.from
    }

    /// The declared name of the observed element, if one was given.
    pub fn of_name(&self) -> Option<&str> {
        self.of_name.as_deref()
    }

    /// The declared name of the receiving element, if one was given.
    pub fn from_name(&self) -> Option<&str> {
        self.from_name.as_deref()
    }

    /// The declared offset anchor name, if one was given.
    pub fn relative_to_name(&self) -> Option<&str> {
        self.relative_to.as_deref()
    }
}

/// The relations owned by one element, at most one per kind, iterated in
/// attach order.
#[derive(Debug, Clone, Default)]
pub struct RelationSet {
    items: Vec<Relation>,
}

impl RelationSet {
    pub(crate) fn insert(&mut self, owner: &str, relation: Relation) -> Result<(), ModelError> {
        if self.has(relation.kind) {
            return Err(ModelError::DuplicateRelation(
                owner.to_string(),
                relation.kind,
            ));
        }
        self.items.push(relation);
        Ok(())
    }

    /// Looks up the relation of a kind. Absence is an expected soft result,
    /// not an error.
    pub fn get(&self, kind: RelationKind) -> Option<&Relation> {
        self.items.iter().find(|r| r.kind == kind)
    }

    pub(crate) fn nth(&self, index: usize) -> &Relation {
        &self.items[index]
    }

    pub(crate) fn nth_mut(&mut self, index: usize) -> &mut Relation {
        &mut self.items[index]
    }

    pub fn has(&self, kind: RelationKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relation> {
        self.items.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Relation> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_relation_per_kind() {
        let mut set = RelationSet::default();
        set.insert("field", Relation::size_of("payload")).unwrap();
        let err = set
            .insert("field", Relation::size_of("other"))
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::DuplicateRelation(_, RelationKind::Size)
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn different_kinds_coexist_in_attach_order() {
        let mut set = RelationSet::default();
        set.insert("field", Relation::count_of("items")).unwrap();
        set.insert("field", Relation::size_of("payload")).unwrap();
        let kinds: Vec<_> = set.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RelationKind::Count, RelationKind::Size]);
    }

    #[test]
    fn absent_kind_is_a_soft_none() {
        let set = RelationSet::default();
        assert!(set.get(RelationKind::Offset).is_none());
        assert!(!set.has(RelationKind::When));
    }
}
