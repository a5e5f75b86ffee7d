//! End-to-end build scenarios over stub tools.
//!
//! Every external tool is a shell script that mimics the observable
//! behaviour the build relies on: the preprocessor resolves `#ifdef`
//! branches, the compiler writes module files whose content is a checksum
//! of the source, and the linker concatenates objects. Each script logs its
//! invocations so the tests can assert which work was skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fab::config::{BuildConfig, ToolBox};
use fab::steps::analyse::Analyse;
use fab::steps::archive::ArchiveObjects;
use fab::steps::c_pragmas::CPragmaInjector;
use fab::steps::cleanup::CleanupPrebuilds;
use fab::steps::compile_c::CompileC;
use fab::steps::compile_fortran::CompileFortran;
use fab::steps::find_source_files::FindSourceFiles;
use fab::steps::link::LinkExe;
use fab::steps::preprocess::{PreprocessC, PreprocessFortran};
use fab::steps::Step;
use fab::store;
use fab::ArtefactStore;
use fab::Tool;
use tempfile::TempDir;

/// Shell-script stand-ins for cpp, gfortran and the linker, with call logs.
struct StubTools {
    dir: PathBuf,
}

impl StubTools {
    fn create(root: &Path) -> Self {
        let dir = root.join("stub-tools");
        std::fs::create_dir_all(&dir).unwrap();

        write_script(
            &dir.join("cpp"),
            r#"#!/bin/sh
dir="$(dirname "$0")"
define=0
in=""; out=""
for a in "$@"; do
  case "$a" in
    -DSHOULD_I_STAY) define=1 ;;
    -*) ;;
    *) if [ -z "$in" ]; then in="$a"; else out="$a"; fi ;;
  esac
done
echo "cpp $in" >> "$dir/cpp.log"
if [ "$define" = 1 ]; then
  sed '/^#/d; /go_now_mod/d' "$in" > "$out"
else
  sed '/^#/d; /stay_mod/d' "$in" > "$out"
fi
"#,
        );

        // the C preprocessor must keep the fab pragmas
        write_script(
            &dir.join("cpp-c"),
            r#"#!/bin/sh
dir="$(dirname "$0")"
in=""; out=""
for a in "$@"; do
  case "$a" in
    -*) ;;
    *) if [ -z "$in" ]; then in="$a"; else out="$a"; fi ;;
  esac
done
echo "cpp-c $in" >> "$dir/cpp.log"
sed '/^#include/d; /^#if/d; /^#else/d; /^#endif/d' "$in" > "$out"
"#,
        );

        // named gfortran so the scheduler manages -c and -J
        write_script(
            &dir.join("gfortran"),
            r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "stub-fc 1.0.0"; exit 0; fi
dir="$(dirname "$0")"
moddir=""; out=""; src=""; syntax_only=0
while [ $# -gt 0 ]; do
  case "$1" in
    -J) moddir="$2"; shift 2 ;;
    -o) out="$2"; shift 2 ;;
    -fsyntax-only) syntax_only=1; shift ;;
    -*) shift ;;
    *) src="$1"; shift ;;
  esac
done
sum="$(cksum "$src" | cut -d' ' -f1)"
echo "compile $src" >> "$dir/fc.log"
grep -i '^module ' "$src" | awk '{print tolower($2)}' | while read m; do
  echo "mod $m $sum" > "$moddir/$m.mod"
done
if [ "$syntax_only" = 0 ]; then
  echo "obj $src $sum" > "$out"
fi
"#,
        );

        write_script(
            &dir.join("cc"),
            r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "stub-cc 1.0.0"; exit 0; fi
dir="$(dirname "$0")"
out=""; src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -*) shift ;;
    *) src="$1"; shift ;;
  esac
done
sum="$(cksum "$src" | cut -d' ' -f1)"
echo "compile $src" >> "$dir/cc.log"
echo "cobj $src $sum" > "$out"
"#,
        );

        write_script(
            &dir.join("ld"),
            r#"#!/bin/sh
dir="$(dirname "$0")"
out=""; objs=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -*) shift ;;
    *) objs="$objs $1"; shift ;;
  esac
done
echo "link $out" >> "$dir/ld.log"
cat $objs > "$out"
"#,
        );

        StubTools { dir }
    }

    fn toolbox(&self) -> ToolBox {
        let mut tools = ToolBox::from_env();
        tools.fpp = Tool::new(self.dir.join("cpp").to_string_lossy());
        tools.cpp = Tool::new(self.dir.join("cpp-c").to_string_lossy());
        tools.fc = Tool::new(self.dir.join("gfortran").to_string_lossy());
        tools.cc = Tool::new(self.dir.join("cc").to_string_lossy());
        tools.ld = Tool::new(self.dir.join("ld").to_string_lossy());
        tools
    }

    fn log_count(&self, log: &str) -> usize {
        std::fs::read_to_string(self.dir.join(log))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn fc_compiles(&self) -> usize {
        self.log_count("fc.log")
    }

    fn cpp_runs(&self) -> usize {
        self.log_count("cpp.log")
    }
}

fn write_script(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn write_sources(config: &BuildConfig, sources: &[(&str, &str)]) {
    for (name, content) in sources {
        let fpath = config.source_root().join(name);
        std::fs::create_dir_all(fpath.parent().unwrap()).unwrap();
        std::fs::write(&fpath, content).unwrap();
    }
}

/// Run the standard Fortran pipeline against a fresh store.
fn run_fortran_pipeline(
    config: &BuildConfig,
    roots: &[&str],
    two_stage: bool,
) -> ArtefactStore {
    let mut store_ = ArtefactStore::new();

    let mut analyse = Analyse::new();
    for root in roots {
        analyse = analyse.root_symbol(root);
    }

    FindSourceFiles::new().run(&mut store_, config).unwrap();
    PreprocessFortran::new().run(&mut store_, config).unwrap();
    analyse.run(&mut store_, config).unwrap();
    CompileFortran::new()
        .two_stage(two_stage)
        .run(&mut store_, config)
        .unwrap();
    LinkExe::new().run(&mut store_, config).unwrap();

    store_
}

const FIRST_F90: &str = "PROGRAM first\n\
                         USE greeting_mod, ONLY: greet\n\
                         CALL greet(buf)\n\
                         END PROGRAM first\n";
const SECOND_F90: &str = "PROGRAM second\n\
                          USE bye_mod\n\
                          END PROGRAM second\n";
const GREETING_MOD_F90: &str = "MODULE greeting_mod\n\
                                USE constants_mod\n\
                                CONTAINS\n\
                                SUBROUTINE greet(buf)\n\
                                END SUBROUTINE greet\n\
                                END MODULE greeting_mod\n";
const BYE_MOD_F90: &str = "MODULE bye_mod\n\
                           USE constants_mod\n\
                           END MODULE bye_mod\n";
const CONSTANTS_MOD_F90: &str = "MODULE constants_mod\nEND MODULE constants_mod\n";

fn shared_module_sources(config: &BuildConfig) {
    write_sources(
        config,
        &[
            ("first.F90", FIRST_F90),
            ("second.F90", SECOND_F90),
            ("greeting_mod.F90", GREETING_MOD_F90),
            ("bye_mod.F90", BYE_MOD_F90),
            ("constants_mod.F90", CONSTANTS_MOD_F90),
        ],
    );
}

#[test]
fn two_programs_sharing_a_module_build_two_executables() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());
    let config = BuildConfig::with_workspace("s1", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(2);
    shared_module_sources(&config);

    let store_ = run_fortran_pipeline(&config, &["first", "second"], false);

    let trees = store_.trees().unwrap();
    let first_files: Vec<String> = trees["first"]
        .paths()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        first_files,
        vec!["constants_mod.f90", "first.f90", "greeting_mod.f90"]
    );
    let second_files: Vec<String> = trees["second"]
        .paths()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        second_files,
        vec!["bye_mod.f90", "constants_mod.f90", "second.f90"]
    );

    let exes = store_.paths(store::EXECUTABLES).unwrap();
    assert_eq!(exes.len(), 2);
    assert!(config.project_workspace().join("first").exists());
    assert!(config.project_workspace().join("second").exists());

    // each executable holds exactly its tree's objects
    let first_exe = std::fs::read_to_string(config.project_workspace().join("first")).unwrap();
    assert!(first_exe.contains("greeting_mod"));
    assert!(!first_exe.contains("bye_mod"));
}

#[test]
fn unchanged_rebuild_runs_no_tools_and_reproduces_executables() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());
    let config = BuildConfig::with_workspace("rebuild", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(2);
    shared_module_sources(&config);

    run_fortran_pipeline(&config, &["first", "second"], false);
    let cpp_after_first = stubs.cpp_runs();
    let fc_after_first = stubs.fc_compiles();
    let first_exe = std::fs::read(config.project_workspace().join("first")).unwrap();

    run_fortran_pipeline(&config, &["first", "second"], false);

    // full cache hit: zero preprocessor and zero compiler invocations
    assert_eq!(stubs.cpp_runs(), cpp_after_first);
    assert_eq!(stubs.fc_compiles(), fc_after_first);

    let second_exe = std::fs::read(config.project_workspace().join("first")).unwrap();
    assert_eq!(first_exe, second_exe);
}

#[test]
fn modifying_one_file_rebuilds_exactly_its_reverse_closure() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());
    let config = BuildConfig::with_workspace("incremental", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(2);
    shared_module_sources(&config);

    run_fortran_pipeline(&config, &["first", "second"], false);
    let cpp_before = stubs.cpp_runs();
    let fc_before = stubs.fc_compiles();

    // a change to greeting_mod changes its module file, reaching first
    // along the reverse use edge, and nothing else
    write_sources(
        &config,
        &[(
            "greeting_mod.F90",
            "MODULE greeting_mod\n\
             USE constants_mod\n\
             CONTAINS\n\
             SUBROUTINE greet(buf)\n\
             ! now with a comment\n\
             END SUBROUTINE greet\n\
             END MODULE greeting_mod\n",
        )],
    );

    run_fortran_pipeline(&config, &["first", "second"], false);

    assert_eq!(stubs.cpp_runs(), cpp_before + 1, "only f is re-preprocessed");

    let fc_log = std::fs::read_to_string(stubs.dir.join("fc.log")).unwrap();
    let new_compiles: Vec<&str> = fc_log.lines().skip(fc_before).collect();
    assert_eq!(
        new_compiles.len(),
        2,
        "exactly f and its reverse closure recompile: {new_compiles:?}"
    );
    assert!(new_compiles.iter().any(|l| l.contains("greeting_mod.f90")));
    assert!(new_compiles.iter().any(|l| l.contains("first.f90")));
}

#[test]
fn preprocessor_flags_select_the_branch_and_variants_coexist() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());
    let config = BuildConfig::with_workspace("s2", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(1);

    write_sources(
        &config,
        &[
            (
                "stay_or_go.F90",
                "PROGRAM stay_or_go_now\n\
                 #if defined(SHOULD_I_STAY)\n\
                 USE stay_mod\n\
                 #else\n\
                 USE go_now_mod\n\
                 #endif\n\
                 END PROGRAM stay_or_go_now\n",
            ),
            ("stay_mod.F90", "MODULE stay_mod\nEND MODULE stay_mod\n"),
            ("go_now_mod.F90", "MODULE go_now_mod\nEND MODULE go_now_mod\n"),
        ],
    );

    let build = |flags: &[&str]| {
        let mut store_ = ArtefactStore::new();
        FindSourceFiles::new().run(&mut store_, &config).unwrap();
        PreprocessFortran::new()
            .common_flags(flags)
            .run(&mut store_, &config)
            .unwrap();
        Analyse::new()
            .root_symbol("stay_or_go_now")
            .run(&mut store_, &config)
            .unwrap();
        CompileFortran::new().run(&mut store_, &config).unwrap();
        store_
    };

    let staying = build(&["-DSHOULD_I_STAY"]);
    let staying_tree: Vec<String> = staying.trees().unwrap()["stay_or_go_now"]
        .paths()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(staying_tree, vec!["stay_mod.f90", "stay_or_go.f90"]);

    let going = build(&[]);
    let going_tree: Vec<String> = going.trees().unwrap()["stay_or_go_now"]
        .paths()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(going_tree, vec!["go_now_mod.f90", "stay_or_go.f90"]);

    // the two variants of stay_or_go hold different prebuild keys, so both
    // preprocessed sources and both objects coexist in the cache
    let variants = |suffix: &str| {
        config
            .prebuild()
            .entries()
            .unwrap()
            .into_iter()
            .filter(|p| {
                let name = p.file_name().unwrap().to_string_lossy().to_string();
                name.starts_with("stay_or_go.") && name.ends_with(suffix)
            })
            .count()
    };
    assert_eq!(variants(".f90"), 2);
    assert_eq!(variants(".o"), 2);
}

const F_INTERS_F90: &str = "PROGRAM f_inters\n\
                            ! DEPENDS ON: f_var.o\n\
                            CALL report_var()\n\
                            END PROGRAM f_inters\n";
const F_VAR_C: &str = "#include <stdio.h>\n\
                       int f_var = 0;\n\
                       int* get_f_var_ptr(void) {\n\
                           return &f_var;\n\
                       }\n";

#[test]
fn fortran_c_interop_links_one_executable() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());
    let config = BuildConfig::with_workspace("s3", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(1);

    write_sources(&config, &[("f_inters.F90", F_INTERS_F90), ("f_var.c", F_VAR_C)]);

    let mut store_ = ArtefactStore::new();
    FindSourceFiles::new().run(&mut store_, &config).unwrap();
    CPragmaInjector::new().run(&mut store_, &config).unwrap();
    PreprocessFortran::new().run(&mut store_, &config).unwrap();
    PreprocessC::new().run(&mut store_, &config).unwrap();
    Analyse::new()
        .root_symbol("f_inters")
        .run(&mut store_, &config)
        .unwrap();
    CompileFortran::new().run(&mut store_, &config).unwrap();
    CompileC::new().run(&mut store_, &config).unwrap();
    ArchiveObjects::new().run(&mut store_, &config).unwrap();
    LinkExe::new().run(&mut store_, &config).unwrap();

    // the build tree pulled the C file in via the object pragma
    let tree_files: Vec<String> = store_.trees().unwrap()["f_inters"]
        .paths()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(tree_files, vec!["f_inters.f90", "f_var.c"]);

    // both objects flowed through the archive into one executable
    let exe = config.project_workspace().join("f_inters");
    assert!(exe.exists());
    let contents = std::fs::read_to_string(&exe).unwrap();
    assert!(contents.contains("obj f_inters.f90"));
    assert!(contents.contains("cobj"));
}

#[test]
fn imported_cache_serves_a_fresh_workspace() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());

    let config_a = BuildConfig::with_workspace("user-a", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(1);
    shared_module_sources(&config_a);
    run_fortran_pipeline(&config_a, &["first", "second"], false);
    let fc_after_a = stubs.fc_compiles();

    // second user: same sources, empty workspace, imported prebuild folder
    let config_b = BuildConfig::with_workspace("user-b", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(1);
    shared_module_sources(&config_b);
    for entry in config_a.prebuild().entries().unwrap() {
        let dest = config_b.prebuild().folder().join(entry.file_name().unwrap());
        std::fs::copy(&entry, &dest).unwrap();
    }

    run_fortran_pipeline(&config_b, &["first", "second"], false);

    assert_eq!(
        stubs.fc_compiles(),
        fc_after_a,
        "all artefacts served from the imported cache"
    );
    assert!(config_b.project_workspace().join("first").exists());
}

#[test]
fn two_stage_compile_reproduces_single_stage_output() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());

    let config_single = BuildConfig::with_workspace("single", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(2);
    shared_module_sources(&config_single);
    run_fortran_pipeline(&config_single, &["first"], false);

    let config_two = BuildConfig::with_workspace("two-stage", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(2);
    shared_module_sources(&config_two);
    run_fortran_pipeline(&config_two, &["first"], true);

    let single_exe = std::fs::read(config_single.project_workspace().join("first")).unwrap();
    let two_exe = std::fs::read(config_two.project_workspace().join("first")).unwrap();
    assert_eq!(single_exe, two_exe);
}

#[test]
fn run_scope_writes_log_metrics_and_sweeps_the_cache() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());
    let config = BuildConfig::with_workspace("scope", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(1);
    shared_module_sources(&config);

    // a stale entry from some older configuration
    let stale = config.prebuild().folder().join("stale.ff.o");
    std::fs::write(&stale, "old").unwrap();

    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(FindSourceFiles::new()),
        Box::new(PreprocessFortran::new()),
        Box::new(Analyse::new().root_symbol("first").root_symbol("second")),
        Box::new(CompileFortran::new()),
        Box::new(LinkExe::new()),
    ];
    config.run(&steps).unwrap();

    assert!(config.project_workspace().join("log.txt").exists());
    assert!(config
        .project_workspace()
        .join("metrics/metrics.json")
        .exists());
    assert!(config.project_workspace().join("first").exists());

    // default housekeeping removed the stale entry but kept this run's
    assert!(!stale.exists());
    assert!(!config.prebuild().entries().unwrap().is_empty());

    // an explicit housekeeping step with a long retention keeps everything
    let entries_before = config.prebuild().entries().unwrap().len();
    let steps: Vec<Box<dyn Step>> = vec![Box::new(
        CleanupPrebuilds::new().older_than(Duration::from_secs(3600)),
    )];
    config.run(&steps).unwrap();
    assert_eq!(config.prebuild().entries().unwrap().len(), entries_before);
}

#[test]
fn library_build_archives_everything() {
    let tmp = TempDir::new().unwrap();
    let stubs = StubTools::create(tmp.path());
    let config = BuildConfig::with_workspace("lib", tmp.path())
        .unwrap()
        .with_tools(stubs.toolbox())
        .with_n_procs(1);

    write_sources(
        &config,
        &[
            ("greeting_mod.F90", GREETING_MOD_F90),
            ("bye_mod.F90", BYE_MOD_F90),
            ("constants_mod.F90", CONSTANTS_MOD_F90),
        ],
    );

    let mut store_ = ArtefactStore::new();
    FindSourceFiles::new().run(&mut store_, &config).unwrap();
    PreprocessFortran::new().run(&mut store_, &config).unwrap();
    Analyse::new().library().run(&mut store_, &config).unwrap();
    CompileFortran::new().run(&mut store_, &config).unwrap();
    ArchiveObjects::new().run(&mut store_, &config).unwrap();

    let archives: BTreeMap<String, PathBuf> = store_.archives().unwrap().clone();
    assert_eq!(archives.len(), 1);
    assert!(archives["library"].ends_with("build_output/library.a"));

    let objects = store_.objects().unwrap();
    assert_eq!(objects["library"].len(), 3);
}
