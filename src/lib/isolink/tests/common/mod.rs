//! Shared fixture machinery: C sources compiled into shared objects at test
//! time, cached in the cargo tmp dir.

use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, Once},
};

static BUILD_LOCK: Mutex<()> = Mutex::new(());
static LOGGING: Once = Once::new();

pub fn setup_logging() {
    LOGGING.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn tmpdir() -> PathBuf {
    PathBuf::from(env!("CARGO_TARGET_TMPDIR"))
}

/// Compile `source` into `<tmpdir>/<name>.so` and return the path. Rebuilds
/// only when the cached source text differs.
pub fn build_fixture(name: &str, source: &str) -> PathBuf {
    build_fixture_with(name, source, &["-fPIC", "-ftls-model=global-dynamic"])
}

/// Like [build_fixture], with full control over codegen and linker flags for
/// fixtures that need a specific relocation form.
pub fn build_fixture_with(name: &str, source: &str, extra_args: &[&str]) -> PathBuf {
    let _guard = BUILD_LOCK.lock().unwrap();
    let dir = tmpdir();
    fs::create_dir_all(&dir).unwrap();
    let src_path = dir.join(format!("{}.c", name));
    let so_path = dir.join(format!("{}.so", name));

    if so_path.exists() && fs::read_to_string(&src_path).is_ok_and(|old| old == source) {
        return so_path;
    }
    fs::write(&src_path, source).unwrap();

    let compiler = cc::Build::new()
        .opt_level(0)
        .target("x86_64-unknown-linux-gnu")
        .host("x86_64-unknown-linux-gnu")
        .get_compiler();
    let status = compiler
        .to_command()
        .arg("-shared")
        .args(extra_args)
        .arg("-o")
        .arg(&so_path)
        .arg(&src_path)
        .status()
        .unwrap();
    assert!(status.success(), "failed to compile fixture {}", name);
    so_path
}
