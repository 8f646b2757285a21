#![no_main]

use libfuzzer_sys::fuzz_target;

use meshresponder::autoreply::pattern::Bindings;
use meshresponder::autoreply::tokens::{expand, TokenValues};
use meshresponder::scripts::args::split_args;

// Argument templates mix tokens, braces and quotes in arbitrary ways.
fuzz_target!(|data: &[u8]| {
    let Ok(template) = std::str::from_utf8(data) else {
        return;
    };

    let mut params = Bindings::new();
    params.insert("location", "Austin TX");
    let values = TokenValues {
        ip: Some("10.0.0.1".to_string()),
        port: Some(4403),
        node_id: Some("!abcd1234".to_string()),
        params,
        ..TokenValues::new()
    };

    let expanded = expand(template, &values);
    let _ = split_args(&expanded);

    // Text without braces passes through untouched
    if !template.contains('{') {
        assert_eq!(expanded, template);
    }
});
