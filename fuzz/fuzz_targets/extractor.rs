#![no_main]

use fansy_tracer::extractor::{extract, Arity};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = std::str::from_utf8(data) {
        // Must not panic; ordinals follow text order
        for (i, site) in extract(body).enumerate() {
            assert_eq!(site.ordinal, i);
            assert!(body.is_char_boundary(site.offset));
            if let Arity::Resolved(n) = site.arity {
                assert!(n <= site.args_text.len() + 1);
            }
        }
    }
});
