use std::collections::HashMap;
use std::io::Read;
use std::slice;
use std::str;

use fabric_core::{memory, reader_tmp};

#[test]
fn clear_all_reuses_the_backing_block() {
    let scratch = memory::tmp();

    let first: Vec<usize> = (0..10)
        .map(|_| scratch.alloc(64, 8).unwrap().as_ptr() as usize)
        .collect();
    let capacity = scratch.capacity();
    let blocks = scratch.block_count();

    scratch.clear_all();

    let second: Vec<usize> = (0..10)
        .map(|_| scratch.alloc(64, 8).unwrap().as_ptr() as usize)
        .collect();

    assert_eq!(first, second, "regions after a clear reuse the same block");
    assert_eq!(scratch.capacity(), capacity, "no backing-store growth");
    assert_eq!(scratch.block_count(), blocks);
}

#[test]
fn word_frequency_with_scratch_tokenization() {
    let mut reader = reader_tmp();
    reader.reset(b"a b a\nb c");
    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();

    let scratch = memory::tmp();
    let mut freq: HashMap<String, usize> = HashMap::new();
    let mut settled_capacity = None;

    for line in text.lines() {
        // Tokenize a scratch copy of the line; the copy dies at clear_all.
        let copy = scratch.alloc_bytes(line.as_bytes()).unwrap();
        let copy = unsafe {
            str::from_utf8_unchecked(slice::from_raw_parts(copy.as_ptr(), line.len()))
        };
        for word in copy.split(' ') {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            *freq.entry(word.to_owned()).or_insert(0) += 1;
        }
        scratch.clear_all();

        // The arena's footprint settles after the first line instead of
        // growing with every iteration.
        let capacity = scratch.capacity();
        match settled_capacity {
            None => settled_capacity = Some(capacity),
            Some(settled) => assert_eq!(capacity, settled),
        }
    }

    let mut expected = HashMap::new();
    expected.insert("a".to_owned(), 2);
    expected.insert("b".to_owned(), 2);
    expected.insert("c".to_owned(), 1);
    assert_eq!(freq, expected);
}

#[test]
fn peak_tracks_the_high_water_mark_across_clears() {
    let scratch = memory::tmp();
    scratch.clear_all();
    let floor = scratch.peak();

    for round in 1..=4 {
        for _ in 0..round {
            scratch.alloc(1024, 8).unwrap();
        }
        scratch.clear_all();
    }

    assert!(scratch.peak() >= floor.max(4 * 1024));
    assert_eq!(scratch.used(), 0);
}
