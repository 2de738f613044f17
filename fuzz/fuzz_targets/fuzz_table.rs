#![no_main]

use arbitrary::Arbitrary;
use gmindex::index::table::{write_table, IdentifierSetBuilder, IdentifierTable};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    declarations: Vec<(String, u16)>,
    load_factor: u8,
    probe: String,
}

fuzz_target!(|input: Input| {
    // Every declared name must be found with exactly its modules
    let mut builder = IdentifierSetBuilder::new();
    for (name, module) in &input.declarations {
        builder.insert(name, u32::from(*module));
    }
    let entries = builder.finish();
    let load_factor = 0.1 + f64::from(input.load_factor % 80) / 100.0;
    let serialized = write_table(&entries, load_factor);
    let table = IdentifierTable::new(&serialized.table, &serialized.strings, &serialized.sets)
        .expect("freshly written table must validate");

    for entry in &entries {
        let found: Vec<u32> = table.lookup(&entry.name).iter().collect();
        assert_eq!(found, entry.modules);
    }
    if !entries.iter().any(|e| e.name == input.probe) {
        assert!(table.lookup(&input.probe).is_empty());
    }
});
