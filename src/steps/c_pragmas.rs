//! C include pragma injection.
//!
//! Wraps every `#include` in marker pragmas identifying whether the included
//! text came from a user or a system header. The markers survive
//! preprocessing, letting the C analyser skip system code and recognise
//! project-internal declarations.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::steps::{check_for_errors, run_mp, Step};
use crate::store::{self, ArtefactStore};

static USR_INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*#\s*include\s+"\S*""#).unwrap());
static SYS_INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#\s*include\s+<\S*>").unwrap());

/// Annotate C sources with include-region pragmas, producing `.prag` files
/// alongside the source.
pub struct CPragmaInjector {
    source: &'static str,
    output_collection: &'static str,
}

impl Default for CPragmaInjector {
    fn default() -> Self {
        CPragmaInjector {
            source: store::C_BUILD_FILES,
            output_collection: store::PRAGMAD_C,
        }
    }
}

impl CPragmaInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, name: &'static str) -> Self {
        self.source = name;
        self
    }

    pub fn output_collection(mut self, name: &'static str) -> Self {
        self.output_collection = name;
        self
    }

    fn process_artefact(fpath: &Path) -> BuildResult<(PathBuf, PathBuf)> {
        let source = crate::util::fs::read_to_string(fpath)
            .map_err(|e| BuildError::io(fpath, e))?;

        let output_fpath = fpath.with_extension("prag");
        crate::util::fs::write_string(&output_fpath, &inject_pragmas(&source))
            .map_err(|e| BuildError::io(&output_fpath, e))?;

        Ok((fpath.to_path_buf(), output_fpath))
    }
}

/// The annotated text for one C source.
pub fn inject_pragmas(source: &str) -> String {
    let mut out = String::with_capacity(source.len());

    for line in source.lines() {
        if USR_INCLUDE_RE.is_match(line) {
            out.push_str("#pragma fab UsrIncludeStart\n");
            out.push_str(line);
            out.push('\n');
            out.push_str("#pragma fab UsrIncludeEnd\n");
        } else if SYS_INCLUDE_RE.is_match(line) {
            out.push_str("#pragma fab SysIncludeStart\n");
            out.push_str(line);
            out.push('\n');
            out.push_str("#pragma fab SysIncludeEnd\n");
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}

impl Step for CPragmaInjector {
    fn name(&self) -> &str {
        "c pragma injector"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let files = store.paths(self.source)?;

        let results = run_mp(config, &files, |fpath| Self::process_artefact(fpath));
        let (processed, error) = check_for_errors(results);

        for (original, pragmad) in &processed {
            store.replace_path(self.source, original, pragmad.clone())?;
            store.add_path(self.output_collection, pragmad.clone())?;
        }

        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn includes_are_bracketed() {
        let annotated = inject_pragmas(
            "#include <stdio.h>\n\
             #include \"project.h\"\n\
             int main(void) { return 0; }\n",
        );

        let expected = "#pragma fab SysIncludeStart\n\
                        #include <stdio.h>\n\
                        #pragma fab SysIncludeEnd\n\
                        #pragma fab UsrIncludeStart\n\
                        #include \"project.h\"\n\
                        #pragma fab UsrIncludeEnd\n\
                        int main(void) { return 0; }\n";
        assert_eq!(annotated, expected);
    }

    #[test]
    fn step_rewrites_the_collection() {
        let tmp = TempDir::new().unwrap();
        let config = BuildConfig::with_workspace("prag-test", tmp.path()).unwrap();

        let c_file = tmp.path().join("f_var.c");
        std::fs::write(&c_file, "#include \"f_var.h\"\nint f_var = 0;\n").unwrap();

        let mut store_ = ArtefactStore::new();
        store_.add_path(store::C_BUILD_FILES, &c_file).unwrap();

        CPragmaInjector::new().run(&mut store_, &config).unwrap();

        let prag = tmp.path().join("f_var.prag");
        assert!(prag.exists());
        assert_eq!(store_.paths(store::C_BUILD_FILES).unwrap(), vec![prag.clone()]);
        assert_eq!(store_.paths(store::PRAGMAD_C).unwrap(), vec![prag]);
    }
}
