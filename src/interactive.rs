use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Error, ErrorCategory, Result};
use crate::problem::InteractiveSettings;
use crate::request::Deadline;

/// Output of one compiler invocation: the settings fragment to splice into
/// `settings.json` plus generated files (per-language templates and
/// distributable sources) to materialize into the problem tree.
#[derive(Debug, Clone)]
pub struct CompiledInteractive {
    pub settings: InteractiveSettings,
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Capability interface around the external interactive-problem compiler.
/// The production implementation shells out to libinteractive; tests inject
/// a fake returning canned settings or a canned error.
pub trait InteractiveSettingsCompiler: Send + Sync {
    fn compile(
        &self,
        idl: &[u8],
        module_name: &str,
        main_source: &[u8],
        parent_lang: &str,
        deadline: &Deadline,
    ) -> Result<CompiledInteractive>;
}

/// Compiler backed by a libinteractive jar, invoked as
/// `java -jar <jar> json` over a scratch directory.
pub struct LibinteractiveCompiler {
    pub jar_path: PathBuf,
}

impl LibinteractiveCompiler {
    fn wait_with_deadline(
        child: &mut std::process::Child,
        deadline: &Deadline,
    ) -> Result<std::process::ExitStatus> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if deadline.expired() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::categorized(ErrorCategory::InteractiveCompileTimeout));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn collect_generated(root: &Path, prefix: &str, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.file_type()?.is_dir() {
                Self::collect_generated(&entry.path(), &path, files)?;
            } else {
                files.insert(path, std::fs::read(entry.path())?);
            }
        }
        Ok(())
    }
}

impl InteractiveSettingsCompiler for LibinteractiveCompiler {
    fn compile(
        &self,
        idl: &[u8],
        module_name: &str,
        main_source: &[u8],
        parent_lang: &str,
        deadline: &Deadline,
    ) -> Result<CompiledInteractive> {
        let scratch = tempfile::tempdir()?;
        let idl_path = scratch.path().join(format!("{module_name}.idl"));
        std::fs::write(&idl_path, idl)?;
        std::fs::write(
            scratch.path().join(format!("Main.{parent_lang}")),
            main_source,
        )?;
        let output_dir = scratch.path().join("output");
        std::fs::create_dir_all(&output_dir)?;
        let stdout_path = scratch.path().join("settings.out");
        let stderr_path = scratch.path().join("compile.err");

        let mut child = Command::new("java")
            .arg("-jar")
            .arg(&self.jar_path)
            .arg("json")
            .arg(&idl_path)
            .arg(parent_lang)
            .arg("--module-name")
            .arg(module_name)
            .arg("--output-directory")
            .arg(&output_dir)
            .arg("--omit-debug")
            .stdin(Stdio::null())
            .stdout(Stdio::from(std::fs::File::create(&stdout_path)?))
            .stderr(Stdio::from(std::fs::File::create(&stderr_path)?))
            .spawn()?;

        let status = Self::wait_with_deadline(&mut child, deadline)?;
        if !status.success() {
            let mut stderr = String::new();
            if let Ok(mut file) = std::fs::File::open(&stderr_path) {
                let _ = file.read_to_string(&mut stderr);
            }
            return Err(Error::with_detail(
                ErrorCategory::InteractiveCompileError,
                stderr.trim().to_string(),
            ));
        }

        let raw = std::fs::read(&stdout_path)?;
        let mut settings: InteractiveSettings = serde_json::from_slice(&raw).map_err(|err| {
            Error::with_detail(
                ErrorCategory::InteractiveCompileError,
                format!("malformed compiler output: {err}"),
            )
        })?;
        if settings.module_name.is_empty() {
            settings.module_name = module_name.to_string();
        }
        if settings.parent_lang.is_empty() {
            settings.parent_lang = parent_lang.to_string();
        }

        let mut files = BTreeMap::new();
        Self::collect_generated(&output_dir, "interactive", &mut files)?;
        Ok(CompiledInteractive { settings, files })
    }
}

/// Fake compiler for tests: returns canned settings or a canned error.
#[derive(Debug, Default, Clone)]
pub struct FakeInteractiveSettingsCompiler {
    pub settings: Option<InteractiveSettings>,
    pub error: Option<String>,
}

impl InteractiveSettingsCompiler for FakeInteractiveSettingsCompiler {
    fn compile(
        &self,
        _idl: &[u8],
        module_name: &str,
        _main_source: &[u8],
        parent_lang: &str,
        _deadline: &Deadline,
    ) -> Result<CompiledInteractive> {
        if let Some(error) = &self.error {
            return Err(Error::with_detail(
                ErrorCategory::InteractiveCompileError,
                error.clone(),
            ));
        }
        let mut settings = self.settings.clone().ok_or_else(|| {
            Error::with_detail(ErrorCategory::InteractiveCompileError, "unsupported")
        })?;
        if settings.module_name.is_empty() {
            settings.module_name = module_name.to_string();
        }
        if settings.parent_lang.is_empty() {
            settings.parent_lang = parent_lang.to_string();
        }
        Ok(CompiledInteractive {
            settings,
            files: BTreeMap::new(),
        })
    }
}
