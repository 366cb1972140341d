//! Small driver that assembles a demo packet model and prints the generated
//! output for a few iterations, showing relations and fixups at work.

use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;

use grackle_core::{
    ChecksumFixup, DataModel, Element, ElementId, EngineConfig, Relation, SequenceCounter,
    SequenceIncrementFixup, Variant,
};

#[derive(Parser, Debug)]
#[command(about = "Generate a demo document model and print its bytes")]
struct Args {
    /// Path to an engine configuration TOML file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of documents to generate.
    #[arg(long, default_value_t = 3)]
    iterations: u32,

    /// Payload carried by the demo packet.
    #[arg(long, default_value = "hello, fuzz target")]
    payload: String,
}

/// A framed packet: 16-bit magic, payload length, a run-scoped sequence
/// number, the payload itself and an md5 trailer.
fn build_packet_model(
    config: EngineConfig,
    counter: Rc<SequenceCounter>,
    payload: &[u8],
) -> Result<(DataModel, ElementId, ElementId), anyhow::Error> {
    let mut model = DataModel::with_config(config);
    let root = model.insert(Element::block("packet"))?;
    model.set_root(root);

    let header = model.add_child(root, Element::block("header"))?;
    model.add_child(
        header,
        Element::number("magic", 16)
            .big_endian()
            .with_default(Variant::ULong(0x4752))?
            .token(),
    )?;
    let length = model.add_child(header, Element::number("length", 32))?;
    let sequence = model.add_child(
        header,
        Element::number("sequence", 32)
            .with_fixup(Rc::new(SequenceIncrementFixup::new(counter))),
    )?;

    model.add_child(root, Element::blob("payload", payload.to_vec()))?;
    model.add_child(
        root,
        Element::blob("digest", Vec::new()).with_fixup(Rc::new(ChecksumFixup::new("payload"))),
    )?;

    model.add_relation(length, Relation::size_of("payload"))?;
    model.bind_relations()?;

    Ok((model, root, sequence))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };

    let counter = Rc::new(SequenceCounter::new());
    let (mut model, root, sequence) =
        build_packet_model(config, Rc::clone(&counter), args.payload.as_bytes())?;

    for iteration in 0..args.iterations {
        // Re-arm the sequence fixup; everything else is served from cache.
        model.invalidate(sequence);
        let bytes = model.value(root)?.to_bytes();
        println!("iteration {iteration}: {} bytes", bytes.len());
        println!("  {}", hex(&bytes));
    }
    println!("sequence counter finished at {}", counter.current());
    Ok(())
}
