//! The element node: one field or grouping of the modeled document.
//!
//! Elements live in the [`DataModel`](crate::model::DataModel) arena and are
//! addressed by [`ElementId`]; the structs here carry per-node state only.
//! Construction goes through the builder-style constructors
//! ([`Element::number`], [`Element::block`], ...), after which the node is
//! inserted into a model and wired into the tree.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::bits::{BitStream, Endian};
use crate::fixup::Fixup;
use crate::model::ModelError;
use crate::relation::RelationSet;
use crate::transform::{Transformer, TransformerChain};
use crate::value::Variant;

/// Handle to an element inside its owning [`DataModel`](crate::model::DataModel).
///
/// Ids are only meaningful within the model that issued them and stay stable
/// for the model's lifetime (the arena is append-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(pub(crate) usize);

bitflags! {
    /// Which parts of the value pipeline a mutated value overrides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutateFlags: u32 {
        const OVERRIDE_FIXUP = 0x1;
        const OVERRIDE_TRANSFORMER = 0x2;
        const OVERRIDE_TYPE_CONSTRAINTS = 0x4;
        const OVERRIDE_RELATIONS = 0x8;
    }
}

impl Default for MutateFlags {
    fn default() -> Self {
        MutateFlags::OVERRIDE_FIXUP
    }
}

/// Length metadata, separate from any Size relation.
#[derive(Debug, Clone, Default)]
pub enum LengthSpec {
    #[default]
    None,
    /// Fixed length (bytes for blobs, characters for strings).
    Fixed(u64),
    /// Expression evaluated against a scope containing `self`.
    Calc(String),
}

/// Text encodings supported by string elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii,
    /// Accepted in the model for compatibility, rejected at encode time.
    Utf7,
    Utf8,
    Utf16Le,
    Utf16Be,
    Utf32,
}

/// The per-kind payload of an element.
#[derive(Debug, Clone)]
pub enum ElementKind {
    /// Fixed-width number, signed or unsigned, little- or big-endian.
    Number {
        size_bits: u32,
        signed: bool,
        endian: Endian,
    },
    /// Text with a configured byte encoding.
    Str {
        encoding: StringEncoding,
        null_terminated: bool,
        pad_char: char,
    },
    /// Opaque byte sequence.
    Blob,
    /// Fixed-position bit field inside a Flags container.
    Flag { position: u32, size_bits: u32 },
    /// Ordered sequence of children, concatenated in order.
    Block,
    /// Exactly one child contributes at a time.
    Choice { selected: Option<ElementId> },
    /// Block specialization with cardinality metadata and a template.
    Array {
        min_occurs: u32,
        /// `-1` means unbounded.
        max_occurs: i64,
        has_expanded: bool,
        template: Option<ElementId>,
    },
    /// Bit-field container of Flag children writing into a shared buffer.
    Flags { size_bits: u32, endian: Endian },
}

impl ElementKind {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ElementKind::Block
                | ElementKind::Choice { .. }
                | ElementKind::Array { .. }
                | ElementKind::Flags { .. }
        )
    }

    /// Human-readable kind name for errors and debug output.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ElementKind::Number { .. } => "number",
            ElementKind::Str { .. } => "string",
            ElementKind::Blob => "blob",
            ElementKind::Flag { .. } => "flag",
            ElementKind::Block => "block",
            ElementKind::Choice { .. } => "choice",
            ElementKind::Array { .. } => "array",
            ElementKind::Flags { .. } => "flags",
        }
    }
}

/// Valid range of a number, computed with exact integer arithmetic.
pub(crate) fn numeric_bounds(size_bits: u32, signed: bool) -> (i128, i128) {
    if signed {
        (-(1i128 << (size_bits - 1)), (1i128 << (size_bits - 1)) - 1)
    } else {
        (0, (1i128 << size_bits) - 1)
    }
}

/// Range-checks a prospective default value for a number element.
pub(crate) fn check_number_default(
    name: &str,
    size_bits: u32,
    signed: bool,
    value: &Variant,
) -> Result<(), ModelError> {
    let numeric: i128 = value
        .as_i64()
        .map(i128::from)
        .or_else(|_| value.as_u64().map(i128::from))
        .map_err(|_| ModelError::NonNumericDefault(name.to_string()))?;
    let (min, max) = numeric_bounds(size_bits, signed);
    if numeric < min || numeric > max {
        return Err(ModelError::OutOfRange {
            name: name.to_string(),
            value: numeric,
            min,
            max,
        });
    }
    Ok(())
}

/// One node of the document tree.
pub struct Element {
    pub(crate) name: String,
    pub(crate) kind: ElementKind,
    pub(crate) is_mutable: bool,
    pub(crate) mutation_flags: MutateFlags,
    pub(crate) is_token: bool,
    pub(crate) default_value: Variant,
    pub(crate) mutated_value: Option<Variant>,
    pub(crate) length: LengthSpec,
    pub(crate) fixup: Option<Rc<dyn Fixup>>,
    pub(crate) transformer: TransformerChain,
    pub(crate) relations: RelationSet,

    pub(crate) parent: Option<ElementId>,
    pub(crate) children: Vec<ElementId>,
    pub(crate) child_index: HashMap<String, usize>,
    /// Elements whose relations observe this one (of → from edges).
    pub(crate) dependents: Vec<ElementId>,

    pub(crate) internal_value: RefCell<Option<Variant>>,
    pub(crate) final_value: RefCell<Option<BitStream>>,
    pub(crate) dirty: Cell<bool>,
}

impl Element {
    fn new(name: &str, kind: ElementKind, default_value: Variant) -> Self {
        Self {
            name: name.to_string(),
            kind,
            is_mutable: true,
            mutation_flags: MutateFlags::default(),
            is_token: false,
            default_value,
            mutated_value: None,
            length: LengthSpec::None,
            fixup: None,
            transformer: TransformerChain::new(),
            relations: RelationSet::default(),
            parent: None,
            children: Vec::new(),
            child_index: HashMap::new(),
            dependents: Vec::new(),
            internal_value: RefCell::new(None),
            final_value: RefCell::new(None),
            dirty: Cell::new(true),
        }
    }

    /// An unsigned little-endian number of `size_bits` bits, default 0.
    pub fn number(name: &str, size_bits: u32) -> Self {
        Self::new(
            name,
            ElementKind::Number {
                size_bits,
                signed: false,
                endian: Endian::Little,
            },
            Variant::Int(0),
        )
    }

    /// A string in the given encoding, default empty.
    pub fn string(name: &str, encoding: StringEncoding) -> Self {
        Self::new(
            name,
            ElementKind::Str {
                encoding,
                null_terminated: false,
                pad_char: '\0',
            },
            Variant::Text(String::new()),
        )
    }

    /// An opaque blob with the given default bytes.
    pub fn blob(name: &str, default: Vec<u8>) -> Self {
        Self::new(name, ElementKind::Blob, Variant::Bytes(default))
    }

    /// A bit field at `position` (bit offset within the enclosing Flags
    /// buffer) of `size_bits` bits, default 0.
    pub fn flag(name: &str, position: u32, size_bits: u32) -> Self {
        Self::new(
            name,
            ElementKind::Flag {
                position,
                size_bits,
            },
            Variant::Int(0),
        )
    }

    pub fn block(name: &str) -> Self {
        Self::new(name, ElementKind::Block, Variant::Bytes(Vec::new()))
    }

    pub fn choice(name: &str) -> Self {
        Self::new(
            name,
            ElementKind::Choice { selected: None },
            Variant::Bytes(Vec::new()),
        )
    }

    /// An array with the given cardinality bounds (`max_occurs` of -1 means
    /// unbounded). The template element is set through
    /// [`DataModel::set_array_template`](crate::model::DataModel::set_array_template).
    pub fn array(name: &str, min_occurs: u32, max_occurs: i64) -> Self {
        Self::new(
            name,
            ElementKind::Array {
                min_occurs,
                max_occurs,
                has_expanded: false,
                template: None,
            },
            Variant::Bytes(Vec::new()),
        )
    }

    /// A bit-field container `size_bits` wide.
    pub fn flags(name: &str, size_bits: u32) -> Self {
        Self::new(
            name,
            ElementKind::Flags {
                size_bits,
                endian: Endian::Little,
            },
            Variant::Bytes(Vec::new()),
        )
    }

    /// Marks a number as signed, re-deriving its valid range.
    pub fn signed(mut self) -> Self {
        if let ElementKind::Number { signed, .. } = &mut self.kind {
            *signed = true;
        }
        self
    }

    /// Switches a number or flags container to big-endian encoding.
    pub fn big_endian(mut self) -> Self {
        match &mut self.kind {
            ElementKind::Number { endian, .. } | ElementKind::Flags { endian, .. } => {
                *endian = Endian::Big;
            }
            _ => {}
        }
        self
    }

    pub fn null_terminated(mut self) -> Self {
        if let ElementKind::Str {
            null_terminated, ..
        } = &mut self.kind
        {
            *null_terminated = true;
        }
        self
    }

    pub fn pad_char(mut self, pad: char) -> Self {
        if let ElementKind::Str { pad_char, .. } = &mut self.kind {
            *pad_char = pad;
        }
        self
    }

    /// Sets the default value, range-checking numbers.
    pub fn with_default(mut self, value: Variant) -> Result<Self, ModelError> {
        if let ElementKind::Number {
            size_bits, signed, ..
        } = self.kind
        {
            check_number_default(&self.name, size_bits, signed, &value)?;
        }
        self.default_value = value;
        Ok(self)
    }

    pub fn fixed_length(mut self, length: u64) -> Self {
        self.length = LengthSpec::Fixed(length);
        self
    }

    pub fn calc_length(mut self, expression: &str) -> Self {
        self.length = LengthSpec::Calc(expression.to_string());
        self
    }

    pub fn with_fixup(mut self, fixup: Rc<dyn Fixup>) -> Self {
        self.fixup = Some(fixup);
        self
    }

    /// Appends a transformer stage (encode order is attach order).
    pub fn with_transformer(mut self, stage: Rc<dyn Transformer>) -> Self {
        self.transformer.push(stage);
        self
    }

    pub fn token(mut self) -> Self {
        self.is_token = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.is_mutable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    pub fn is_container(&self) -> bool {
        self.kind.is_container()
    }

    pub fn is_mutable(&self) -> bool {
        self.is_mutable
    }

    pub fn is_token(&self) -> bool {
        self.is_token
    }

    pub fn mutation_flags(&self) -> MutateFlags {
        self.mutation_flags
    }

    pub fn default_value(&self) -> &Variant {
        &self.default_value
    }

    pub fn mutated_value(&self) -> Option<&Variant> {
        self.mutated_value.as_ref()
    }

    pub fn length_spec(&self) -> &LengthSpec {
        &self.length
    }

    pub fn relations(&self) -> &RelationSet {
        &self.relations
    }

    /// Structural sanity check run when the element enters a model.
    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        match self.kind {
            ElementKind::Number { size_bits, .. } if size_bits == 0 || size_bits > 64 => Err(
                ModelError::InvalidBitWidth(self.name.clone(), size_bits),
            ),
            ElementKind::Flag { size_bits, .. } if size_bits == 0 || size_bits > 64 => Err(
                ModelError::InvalidBitWidth(self.name.clone(), size_bits),
            ),
            ElementKind::Flags { size_bits, .. } if size_bits == 0 => Err(
                ModelError::InvalidBitWidth(self.name.clone(), size_bits),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("name", &self.name)
            .field("kind", &self.kind.kind_name())
            .field("dirty", &self.dirty.get())
            .field("children", &self.children.len())
            .field("relations", &self.relations.len())
            .field("fixup", &self.fixup.as_ref().map(|fx| fx.name()))
            .field("transformer", &self.transformer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_bounds_are_exact() {
        assert_eq!(numeric_bounds(8, false), (0, 255));
        assert_eq!(numeric_bounds(1, false), (0, 1));
        assert_eq!(numeric_bounds(64, false), (0, u64::MAX as i128));
    }

    #[test]
    fn signed_bounds_are_exact() {
        assert_eq!(numeric_bounds(8, true), (-128, 127));
        assert_eq!(
            numeric_bounds(64, true),
            (i64::MIN as i128, i64::MAX as i128)
        );
    }

    #[test]
    fn default_mutation_flags_override_fixup_only() {
        let el = Element::number("n", 8);
        assert_eq!(el.mutation_flags(), MutateFlags::OVERRIDE_FIXUP);
        assert!(!el
            .mutation_flags()
            .contains(MutateFlags::OVERRIDE_RELATIONS));
    }

    #[test]
    fn unsigned_number_default_range() {
        assert!(Element::number("n", 8).with_default(Variant::Int(0)).is_ok());
        assert!(Element::number("n", 8).with_default(Variant::Int(255)).is_ok());
        assert!(matches!(
            Element::number("n", 8).with_default(Variant::Int(256)),
            Err(ModelError::OutOfRange { .. })
        ));
        assert!(matches!(
            Element::number("n", 8).with_default(Variant::Int(-1)),
            Err(ModelError::OutOfRange { .. })
        ));
    }

    #[test]
    fn signed_number_default_range() {
        assert!(Element::number("n", 8)
            .signed()
            .with_default(Variant::Int(-128))
            .is_ok());
        assert!(Element::number("n", 8)
            .signed()
            .with_default(Variant::Int(127))
            .is_ok());
        assert!(matches!(
            Element::number("n", 8).signed().with_default(Variant::Int(128)),
            Err(ModelError::OutOfRange { .. })
        ));
    }

    #[test]
    fn non_numeric_default_for_number_is_rejected() {
        assert!(matches!(
            Element::number("n", 8).with_default(Variant::Bytes(vec![1])),
            Err(ModelError::NonNumericDefault(_))
        ));
    }

    #[test]
    fn sixty_four_bit_defaults() {
        assert!(Element::number("n", 64)
            .with_default(Variant::ULong(u64::MAX))
            .is_ok());
        assert!(Element::number("n", 64)
            .signed()
            .with_default(Variant::Long(i64::MIN))
            .is_ok());
        assert!(matches!(
            Element::number("n", 64)
                .signed()
                .with_default(Variant::ULong(u64::MAX)),
            Err(ModelError::OutOfRange { .. })
        ));
    }

    #[test]
    fn width_validation() {
        assert!(Element::number("n", 24).validate().is_ok());
        assert!(Element::number("n", 0).validate().is_err());
        assert!(Element::number("n", 65).validate().is_err());
        assert!(Element::flag("f", 0, 0).validate().is_err());
    }
}
