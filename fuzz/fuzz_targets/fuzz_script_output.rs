#![no_main]

use libfuzzer_sys::fuzz_target;

use meshresponder::scripts::{interpret, ReplyPolicy, ScriptResult};
use std::time::Duration;

// Script stdout is untrusted. Decoding must never panic, and accepted replies
// must respect the length limit.
fuzz_target!(|data: &[u8]| {
    let Some((&flags, stdout)) = data.split_first() else {
        return;
    };

    let result = ScriptResult {
        exit_code: Some(i32::from(flags & 0x03)),
        success: flags & 0x03 == 0,
        stdout: stdout.to_vec(),
        stderr: Vec::new(),
        duration: Duration::ZERO,
        truncated: flags & 0x04 != 0,
    };
    let policy = ReplyPolicy::default();

    if let Ok(replies) = interpret(&result, &policy) {
        assert!(result.success);
        for reply in replies {
            assert!(!reply.is_empty());
            assert!(reply.chars().count() <= policy.max_chars);
        }
    }
});
