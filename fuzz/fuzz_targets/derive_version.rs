#![no_main]

use libfuzzer_sys::fuzz_target;
use pkgsync_version::{RefKind, RefName, derive_version};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    let name = RefName::parse(input);
    if let Ok(version) = derive_version(name.full(), name.kind()) {
        assert!(!version.raw.is_empty());
        assert!(!version.normalized.is_empty());
        if name.kind() == RefKind::Branch {
            assert!(version.normalized.starts_with("dev-") || version.normalized.ends_with("-dev"));
        }
    }
});
