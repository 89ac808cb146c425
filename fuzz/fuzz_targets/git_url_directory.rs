#![no_main]

use libfuzzer_sys::fuzz_target;
use pkgsync_git::git_url_to_directory;

fuzz_target!(|data: &[u8]| {
    let Ok(url) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(dir) = git_url_to_directory(url) {
        assert!(!dir.is_empty());
        assert!(!dir.contains('/'));
        assert!(!dir.contains('\\'));
        assert_ne!(dir, "..");
    }
});
