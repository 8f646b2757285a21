#![no_main]

use libfuzzer_sys::fuzz_target;

use meshresponder::autoreply::pattern::{compile_alternatives, split_alternatives};

// Pattern text comes from trigger authors. Compilation must reject bad input
// with an error, and a compiled pattern must be safe to run on any message.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // First line is the pattern, the rest is the message
    let (pattern, message) = text.split_once('\n').unwrap_or((text, ""));

    for alternative in split_alternatives(pattern) {
        assert!(!alternative.is_empty());
    }

    if let Ok(patterns) = compile_alternatives(pattern) {
        for compiled in &patterns {
            if let Some(bindings) = compiled.captures(message) {
                for (name, _) in bindings.iter() {
                    assert!(compiled.spec().slot_names().any(|slot| slot == name));
                }
            }
        }
    }
});
