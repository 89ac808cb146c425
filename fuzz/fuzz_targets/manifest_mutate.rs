#![no_main]

use std::path::PathBuf;

use libfuzzer_sys::fuzz_target;
use pkgsync_manifest::{Manifest, Source};

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(mut manifest) = Manifest::parse(PathBuf::from("composer.json"), content) else {
        return;
    };

    let name_before = manifest.name().ok().map(str::to_string);
    manifest.set_version("dev-main", "dev-main");
    if manifest.set_source(&Source::git("git@example.com:a/b.git", "0123abc")).is_err() {
        return;
    }

    let Ok(rendered) = manifest.to_pretty_string() else {
        return;
    };
    let reparsed = Manifest::parse(PathBuf::from("composer.json"), &rendered).expect("rendered manifest parses");
    assert_eq!(reparsed.name().ok().map(str::to_string), name_before);
    assert!(rendered.contains(r#""version_normalized": "dev-main""#));
});
