// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Demo: build a small ordered index and poke at transactions.

use kivi::btree::BPlusTree;
use kivi::comparator::LexicalComparator;
use kivi::config::OpenOptions;
use kivi::hashstore::HashStore;
use kivi::txn::with_transaction;
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("kivi demo\n");

    let dir = Path::new("/tmp/kivi_demo");
    std::fs::create_dir_all(dir)?;

    let store_path = dir.join("strings.kch");
    let mut store = HashStore::open(&store_path, OpenOptions::new())?;
    println!("opened hash store at {:?}", store_path);

    let entries = [
        ("page.title@de", "Willkommen"),
        ("page.title@en", "Welcome"),
        ("menu.home@de", "Startseite"),
        ("menu.home@en", "Home"),
    ];
    for (k, v) in entries {
        store.set(k.as_bytes(), v.as_bytes())?;
    }
    println!("inserted {} records, store now holds {}", entries.len(), store.count());

    with_transaction(&mut store, false, |s| {
        s.set(b"menu.about@en", b"About us")?;
        s.set(b"menu.about@de", b"Über uns")?;
        Ok(())
    })?;
    println!("after transaction: {} records", store.count());

    store.close()?;

    let index_path = dir.join("strings.kct");
    let mut index = BPlusTree::open(&index_path, OpenOptions::new().page_size(4096), Box::new(LexicalComparator))?;
    for (k, v) in entries {
        index.set(k.as_bytes(), v.as_bytes())?;
    }
    println!("\nordered keys:");
    struct Printer;
    impl kivi::Visitor for Printer {
        fn visit_full(&mut self, key: &[u8], value: &[u8]) -> kivi::VisitDecision {
            println!("  {} = {}", String::from_utf8_lossy(key), String::from_utf8_lossy(value));
            kivi::VisitDecision::Nop
        }
    }
    index.iterate(&mut Printer, false)?;
    index.close()?;

    Ok(())
}
