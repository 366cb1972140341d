//! Invertible codecs applied to an element's final bit-level value.
//!
//! A [`TransformerChain`] applies its stages in order when encoding and in
//! reverse order when decoding, so the two directions are mirror images and
//! `decode(encode(x)) == x` holds for any correctly paired chain.

use crate::bits::BitStream;
use anyhow::anyhow;
use std::fmt;
use std::rc::Rc;

/// A static, invertible transform of generated data.
///
/// `encode` runs when producing output, `decode` when consuming input.
/// Implementations transform one stage only; ordering across stages is the
/// chain's job.
pub trait Transformer {
    fn name(&self) -> &'static str;
    fn encode(&self, data: BitStream) -> Result<BitStream, anyhow::Error>;
    fn decode(&self, data: BitStream) -> Result<BitStream, anyhow::Error>;
}

/// An ordered sequence of transformers attached to one element.
#[derive(Clone, Default)]
pub struct TransformerChain {
    stages: Vec<Rc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage. Encoding applies stages first-to-last.
    pub fn push(&mut self, stage: Rc<dyn Transformer>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Runs all stages in attach order.
    pub fn encode(&self, mut data: BitStream) -> Result<BitStream, anyhow::Error> {
        for stage in &self.stages {
            data = stage
                .encode(data)
                .map_err(|e| anyhow!("transformer {:?} encode failed: {e}", stage.name()))?;
        }
        Ok(data)
    }

    /// Runs all stages in reverse attach order.
    pub fn decode(&self, mut data: BitStream) -> Result<BitStream, anyhow::Error> {
        for stage in self.stages.iter().rev() {
            data = stage
                .decode(data)
                .map_err(|e| anyhow!("transformer {:?} decode failed: {e}", stage.name()))?;
        }
        Ok(data)
    }
}

impl fmt::Debug for TransformerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

/// Encodes bytes as lowercase ASCII hex; decodes the reverse.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexTransformer;

impl Transformer for HexTransformer {
    fn name(&self) -> &'static str {
        "hex"
    }

    fn encode(&self, data: BitStream) -> Result<BitStream, anyhow::Error> {
        let mut out = String::with_capacity(data.len_bytes() * 2);
        for byte in data.to_bytes() {
            out.push_str(&format!("{byte:02x}"));
        }
        Ok(BitStream::from_bytes(out.as_bytes()))
    }

    fn decode(&self, data: BitStream) -> Result<BitStream, anyhow::Error> {
        let text = data.to_bytes();
        if text.len() % 2 != 0 {
            return Err(anyhow!("hex input has odd length {}", text.len()));
        }
        let mut out = Vec::with_capacity(text.len() / 2);
        for pair in text.chunks(2) {
            let s = std::str::from_utf8(pair).map_err(|_| anyhow!("hex input is not ASCII"))?;
            out.push(u8::from_str_radix(s, 16).map_err(|_| anyhow!("invalid hex pair {s:?}"))?);
        }
        Ok(BitStream::from_bytes(&out))
    }
}

/// XORs every byte with a repeating key. Self-inverse, so encode and decode
/// share one implementation.
#[derive(Debug, Clone)]
pub struct XorTransformer {
    key: Vec<u8>,
}

impl XorTransformer {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    fn apply(&self, data: BitStream) -> Result<BitStream, anyhow::Error> {
        if self.key.is_empty() {
            return Err(anyhow!("xor transformer has an empty key"));
        }
        let masked: Vec<u8> = data
            .to_bytes()
            .iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect();
        Ok(BitStream::from_bytes(&masked))
    }
}

impl Transformer for XorTransformer {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn encode(&self, data: BitStream) -> Result<BitStream, anyhow::Error> {
        self.apply(data)
    }

    fn decode(&self, data: BitStream) -> Result<BitStream, anyhow::Error> {
        self.apply(data)
    }
}
