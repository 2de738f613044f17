#![no_main]

use gmindex::format::{BlockKind, Container};
use gmindex::index::registry::ModuleRegistry;
use gmindex::index::table::IdentifierTable;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a whole index file: every stage must fail cleanly
    let Ok(container) = Container::parse(data) else {
        return;
    };
    if let Some(modules) = container.block(BlockKind::Modules) {
        let _ = ModuleRegistry::decode("/fuzz", modules.data);
    }
    let (Some(table), Some(strings), Some(sets)) = (
        container.block(BlockKind::IdentifierTable),
        container.block(BlockKind::IdentifierStrings),
        container.block(BlockKind::ModuleSets),
    ) else {
        return;
    };
    if let Ok(table) = IdentifierTable::new(table.data, strings.data, sets.data) {
        let _ = table.lookup("foo");
        let _ = table.stats();
        for _ in table.iter() {}
    }
});
