//! Fixups: tree-aware overrides of an element's computed value.
//!
//! A fixup runs as the last step of the internal-value pipeline and receives
//! the whole model for context, so it can hash a sibling or consult ambient
//! run state. Run-scoped state (the sequence counter) is injected explicitly
//! rather than hidden in a process-wide static, keeping test runs isolated.

use std::cell::Cell;
use std::rc::Rc;

use anyhow::anyhow;

use crate::element::ElementId;
use crate::model::DataModel;
use crate::value::Variant;

/// A capability that replaces an element's computed value using the state of
/// the whole tree.
pub trait Fixup {
    fn name(&self) -> &'static str;
    fn fixup(&self, model: &DataModel, element: ElementId) -> Result<Variant, anyhow::Error>;
}

/// Monotonic counter whose lifecycle spans a whole fuzzing run.
///
/// One counter is shared (via `Rc`) by every fixup that should observe the
/// same sequence; it persists across document regenerations by design.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: Cell<u64>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u64) -> Self {
        Self {
            next: Cell::new(value),
        }
    }

    /// Advances the counter and returns the new value (first call yields 1
    /// for a fresh counter).
    pub fn advance(&self) -> u64 {
        let value = self.next.get() + 1;
        self.next.set(value);
        value
    }

    pub fn current(&self) -> u64 {
        self.next.get()
    }

    pub fn reset(&self) {
        self.next.set(0);
    }
}

/// Replaces the element's value with an incrementing sequence number.
///
/// The counter advances once per (re)computation, so a cached value read
/// twice observes the same number until the element is invalidated.
pub struct SequenceIncrementFixup {
    counter: Rc<SequenceCounter>,
}

impl SequenceIncrementFixup {
    pub fn new(counter: Rc<SequenceCounter>) -> Self {
        Self { counter }
    }
}

impl Fixup for SequenceIncrementFixup {
    fn name(&self) -> &'static str {
        "sequence-increment"
    }

    fn fixup(&self, _model: &DataModel, _element: ElementId) -> Result<Variant, anyhow::Error> {
        Ok(Variant::ULong(self.counter.advance()))
    }
}

/// Replaces the element's value with the md5 digest of another element's
/// generated bytes.
pub struct ChecksumFixup {
    target: String,
}

impl ChecksumFixup {
    /// `target` is resolved like a relation endpoint: a dotted path from the
    /// root, or a bare name searched outward from the carrying element.
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }
}

impl Fixup for ChecksumFixup {
    fn name(&self) -> &'static str {
        "checksum-md5"
    }

    fn fixup(&self, model: &DataModel, element: ElementId) -> Result<Variant, anyhow::Error> {
        let target = model
            .find_from(element, &self.target)
            .ok_or_else(|| anyhow!("checksum target {:?} not found", self.target))?;
        let bytes = model.value(target)?.to_bytes();
        let digest = md5::compute(&bytes);
        Ok(Variant::Bytes(digest.0.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;

    #[test]
    fn sequence_counter_is_monotonic_and_resettable() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.advance(), 1);
        assert_eq!(counter.advance(), 2);
        counter.reset();
        assert_eq!(counter.advance(), 1);
        assert_eq!(SequenceCounter::starting_at(10).advance(), 11);
    }

    #[test]
    fn sequence_fixup_advances_per_recomputation_not_per_read() {
        let counter = Rc::new(SequenceCounter::new());
        let mut model = DataModel::new();
        let root = model
            .insert(Element::block("doc"))
            .expect("valid root element");
        model.set_root(root);
        let seq = model
            .add_child(
                root,
                Element::number("seq", 32).with_fixup(Rc::new(SequenceIncrementFixup::new(
                    Rc::clone(&counter),
                ))),
            )
            .unwrap();

        assert_eq!(model.value(seq).unwrap().to_bytes(), vec![1, 0, 0, 0]);
        // Cached: the counter must not tick on a clean re-read.
        assert_eq!(model.value(seq).unwrap().to_bytes(), vec![1, 0, 0, 0]);
        assert_eq!(counter.current(), 1);

        model.invalidate(seq);
        assert_eq!(model.value(seq).unwrap().to_bytes(), vec![2, 0, 0, 0]);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn two_counters_are_isolated() {
        let a = Rc::new(SequenceCounter::new());
        let b = Rc::new(SequenceCounter::new());
        a.advance();
        a.advance();
        assert_eq!(a.current(), 2);
        assert_eq!(b.current(), 0);
    }

    #[test]
    fn checksum_fixup_digests_the_named_sibling() {
        let mut model = DataModel::new();
        let root = model
            .insert(Element::block("doc"))
            .expect("valid root element");
        model.set_root(root);
        model
            .add_child(root, Element::blob("payload", b"some payload".to_vec()))
            .unwrap();
        let digest = model
            .add_child(
                root,
                Element::blob("digest", Vec::new())
                    .with_fixup(Rc::new(ChecksumFixup::new("payload"))),
            )
            .unwrap();

        let expected = md5::compute(b"some payload").0.to_vec();
        assert_eq!(model.value(digest).unwrap().to_bytes(), expected);
    }

    #[test]
    fn checksum_fixup_with_missing_target_fails() {
        let mut model = DataModel::new();
        let root = model
            .insert(Element::block("doc"))
            .expect("valid root element");
        model.set_root(root);
        let digest = model
            .add_child(
                root,
                Element::blob("digest", Vec::new())
                    .with_fixup(Rc::new(ChecksumFixup::new("nonexistent"))),
            )
            .unwrap();
        assert!(model.value(digest).is_err());
    }
}
