//! End-to-end loader behavior against real compiled shared objects.

use std::sync::Arc;

use isolink::{
    library::LibraryState, CustomLibrary, IsolinkError, IsolinkErrorKind, SymbolProvider,
    SystemLibrary,
};

mod common;
use common::{build_fixture, build_fixture_with, setup_logging};

const COUNTER_C: &str = r#"
static long counter = 0;
long counter_bump(void) { return ++counter; }
long counter_value(void) { return counter; }
"#;

const NEEDS_IMPORT_C: &str = r#"
extern long mystery_dep(void);
long use_dep(void) { return mystery_dep() + 1; }
"#;

const DEP_A_C: &str = r#"
long mystery_dep(void) { return 41; }
"#;

const DEP_B_C: &str = r#"
long mystery_dep(void) { return 1041; }
"#;

const TLS_C: &str = r#"
static __thread long tls_counter = 7;
long tls_bump(void) { return ++tls_counter; }
"#;

const CTOR_C: &str = r#"
static long ready = 0;
static long saw_argc = -1;
__attribute__((constructor)) static void init(int argc, char **argv, char **envp) {
    (void)argv; (void)envp;
    ready = 1;
    saw_argc = argc;
}
long fixture_ready(void) { return ready; }
long fixture_argc(void) { return saw_argc; }
"#;

fn load_with_system(path: &std::path::Path) -> Arc<CustomLibrary> {
    let lib = CustomLibrary::create(path);
    lib.add_search_library(Arc::new(SystemLibrary::current()))
        .unwrap();
    lib.load().unwrap();
    lib
}

fn call0(lib: &CustomLibrary, name: &str) -> i64 {
    let sym = lib.sym(name).unwrap().expect(name);
    let f: unsafe extern "C" fn() -> i64 = unsafe { sym.as_fn() };
    unsafe { f() }
}

fn has_kind(err: &IsolinkError, pred: &dyn Fn(&IsolinkErrorKind) -> bool) -> bool {
    pred(&err.kind) || err.related.iter().any(|e| has_kind(e, pred))
}

#[test]
fn isolation_between_instances() {
    setup_logging();
    let path = build_fixture("counter", COUNTER_C);
    let a = load_with_system(&path);
    let b = load_with_system(&path);

    assert_eq!(call0(&a, "counter_bump"), 1);
    assert_eq!(call0(&a, "counter_bump"), 2);
    // B has its own copy of the writable segment.
    assert_eq!(call0(&b, "counter_bump"), 1);
    assert_eq!(call0(&a, "counter_value"), 2);
}

#[test]
fn chain_precedence_end_to_end() {
    setup_logging();
    let dep_a = load_with_system(&build_fixture("dep_a", DEP_A_C));
    let dep_b = load_with_system(&build_fixture("dep_b", DEP_B_C));
    let importer_path = build_fixture("needs_import", NEEDS_IMPORT_C);

    let first = CustomLibrary::create(&importer_path);
    first.add_search_library(dep_a.clone()).unwrap();
    first.add_search_library(dep_b.clone()).unwrap();
    first.load().unwrap();
    assert_eq!(call0(&first, "use_dep"), 42);

    // Same file, reversed chain: the earlier provider wins.
    let second = CustomLibrary::create(&importer_path);
    second.add_search_library(dep_b).unwrap();
    second.add_search_library(dep_a).unwrap();
    second.load().unwrap();
    assert_eq!(call0(&second, "use_dep"), 1042);
}

#[test]
fn unresolved_import_fails_load() {
    setup_logging();
    let path = build_fixture("needs_import_alone", NEEDS_IMPORT_C);
    let lib = CustomLibrary::create(&path);
    let err = lib.load().unwrap_err();
    assert!(has_kind(&err, &|k| matches!(
        k,
        IsolinkErrorKind::LibraryLoadFail { .. }
    )));
    assert!(has_kind(&err, &|k| matches!(
        k,
        IsolinkErrorKind::SymbolLookupFail { symname, .. } if symname == "mystery_dep"
    )));
    assert_eq!(lib.state(), LibraryState::Failed);
    // A failed instance is unusable, not half-loaded.
    assert!(matches!(
        lib.sym("use_dep").unwrap_err().kind,
        IsolinkErrorKind::UseBeforeLoad { .. }
    ));
}

#[test]
fn lookup_miss_is_not_an_error() {
    setup_logging();
    let lib = load_with_system(&build_fixture("counter_miss", COUNTER_C));
    assert!(lib.sym("no_such_symbol").unwrap().is_none());
}

#[test]
fn double_load_is_rejected() {
    setup_logging();
    let lib = load_with_system(&build_fixture("counter_twice", COUNTER_C));
    assert!(matches!(
        lib.load().unwrap_err().kind,
        IsolinkErrorKind::DoubleLoad { .. }
    ));
    // The instance remains usable after the rejected call.
    assert_eq!(lib.state(), LibraryState::Loaded);
    assert_eq!(call0(&lib, "counter_bump"), 1);
}

#[test]
fn use_before_load_is_rejected() {
    setup_logging();
    let lib = CustomLibrary::create(build_fixture("counter_early", COUNTER_C));
    assert!(matches!(
        lib.sym("counter_bump").unwrap_err().kind,
        IsolinkErrorKind::UseBeforeLoad { .. }
    ));
}

#[test]
fn chain_sealed_after_load() {
    setup_logging();
    let lib = load_with_system(&build_fixture("counter_sealed", COUNTER_C));
    let err = lib
        .add_search_library(Arc::new(SystemLibrary::current()))
        .unwrap_err();
    assert!(matches!(err.kind, IsolinkErrorKind::ChainSealed { .. }));
}

#[test]
fn ctor_runs_with_args() {
    setup_logging();
    let path = build_fixture("ctor", CTOR_C);
    let lib = CustomLibrary::create_with_args(&path, &["fixture", "--flag"]).unwrap();
    lib.add_search_library(Arc::new(SystemLibrary::current()))
        .unwrap();
    lib.load().unwrap();
    assert_eq!(call0(&lib, "fixture_ready"), 1);
    assert_eq!(call0(&lib, "fixture_argc"), 2);
}

#[test]
fn tls_starts_from_template_per_thread() {
    setup_logging();
    let lib = load_with_system(&build_fixture("tls", TLS_C));
    assert_eq!(call0(&lib, "tls_bump"), 8);
    assert_eq!(call0(&lib, "tls_bump"), 9);

    // A fresh thread gets a fresh block initialized from the template.
    let lib2 = lib.clone();
    let from_thread = std::thread::spawn(move || call0(&lib2, "tls_bump"))
        .join()
        .unwrap();
    assert_eq!(from_thread, 8);
    assert_eq!(call0(&lib, "tls_bump"), 10);
}

#[test]
fn tls_isolated_between_instances() {
    setup_logging();
    let path = build_fixture("tls_iso", TLS_C);
    let a = load_with_system(&path);
    let b = load_with_system(&path);
    assert_eq!(call0(&a, "tls_bump"), 8);
    assert_eq!(call0(&a, "tls_bump"), 9);
    assert_eq!(call0(&b, "tls_bump"), 8);
}

// Pointer-valued statics and a constructor, so both the data slots and the
// .init_array entry carry relative relocations the linker can pack.
const RELR_C: &str = r#"
static long v = 5;
static long *p = &v;
static long ready = 0;
__attribute__((constructor)) static void init(void) { ready = 1; }
long deref(void) { return *p; }
long relr_ready(void) { return ready; }
"#;

const TLS_IE_C: &str = r#"
static __thread long ie_value = 3;
long ie_get(void) { return ie_value; }
"#;

const TEXTREL_C: &str = r#"
static long x = 9;
long *text_addr(void) { return &x; }
"#;

#[test]
fn packed_relative_relocations_are_applied() {
    setup_logging();
    let path = build_fixture_with(
        "relr",
        RELR_C,
        &["-fPIC", "-Wl,-z,pack-relative-relocs"],
    );
    let lib = CustomLibrary::create(&path);
    lib.add_search_library(Arc::new(SystemLibrary::current()))
        .unwrap();
    lib.load().unwrap();
    assert_eq!(call0(&lib, "deref"), 5);
    assert_eq!(call0(&lib, "relr_ready"), 1);
}

#[test]
fn initial_exec_tls_is_refused() {
    setup_logging();
    let path = build_fixture_with("tls_ie", TLS_IE_C, &["-fPIC", "-ftls-model=initial-exec"]);
    let lib = CustomLibrary::create(&path);
    lib.add_search_library(Arc::new(SystemLibrary::current()))
        .unwrap();
    let err = lib.load().unwrap_err();
    assert!(has_kind(&err, &|k| matches!(
        k,
        IsolinkErrorKind::UnsupportedReloc { reloc, .. } if reloc.contains("TPOFF64")
    )));
    assert_eq!(lib.state(), LibraryState::Failed);
}

#[test]
fn text_relocations_are_refused() {
    setup_logging();
    let path = build_fixture_with(
        "textrel",
        TEXTREL_C,
        // The large code model keeps absolute relocations 64-bit wide so the
        // linker accepts them into a shared object instead of refusing the
        // R_X86_64_32 form outright.
        &["-fno-pic", "-mcmodel=large", "-Wl,-z,notext"],
    );
    let lib = CustomLibrary::create(&path);
    lib.add_search_library(Arc::new(SystemLibrary::current()))
        .unwrap();
    let err = lib.load().unwrap_err();
    assert!(has_kind(&err, &|k| matches!(
        k,
        IsolinkErrorKind::UnsupportedReloc { reloc, .. } if reloc.contains("TEXTREL")
    )));
}

#[test]
fn garbage_file_fails_cleanly() {
    setup_logging();
    let dir = std::path::PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
    let path = dir.join("not_an_elf.so");
    std::fs::write(&path, b"this is not an object file at all").unwrap();
    let lib = CustomLibrary::create(&path);
    assert!(lib.load().is_err());
    assert_eq!(lib.state(), LibraryState::Failed);
}

#[test]
fn loaded_instance_acts_as_provider() {
    setup_logging();
    let dep = load_with_system(&build_fixture("dep_provider", DEP_A_C));
    assert!(dep.resolve("mystery_dep").is_some());
    assert!(dep.resolve("nothing_here").is_none());
    // Data symbols don't leak through the TLS path.
    assert!(dep.resolve_tls("mystery_dep").is_none());
}
