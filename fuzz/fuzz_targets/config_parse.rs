#![no_main]

use libfuzzer_sys::fuzz_target;
use pkgsync_config::Config;

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(config) = Config::from_toml_str(content, None)
        && config.validate().is_ok()
    {
        for repo in &config.repositories {
            let _ = config.working_copy_path(repo);
            assert!(config.get_repository(&repo.url).is_some());
        }
    }
});
