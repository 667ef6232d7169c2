use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use git2::{Oid, Repository, Tree};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCategory, Result};
use crate::interactive::InteractiveSettingsCompiler;
use crate::request::Deadline;
use crate::tree::{build_tree, tree_contents};

/// Hard bound on the wall time of a single push; also caps the
/// `OverallWallTimeLimit` a problem may declare.
pub const OVERALL_WALL_TIME_HARD_LIMIT: Duration = Duration::from_secs(60);

const MAX_PROBLEM_BYTES: u64 = 100 * 1024 * 1024;
const MAX_DIRECTORY_BYTES: u64 = 64 * 1024 * 1024;
const MAX_SOLUTION_FILE_BYTES: u64 = 256 * 1024;

const VALIDATOR_NAMES: &[&str] = &["token", "token-caseless", "token-numeric", "literal", "custom"];
const VALIDATOR_EXTENSIONS: &[&str] = &["cpp", "c", "py", "pas", "kp", "kj", "java", "rb"];
const ALLOWED_DIRECTORIES: &[&str] = &[
    "cases",
    "examples",
    "interactive",
    "solutions",
    "statements",
    "validators",
];
const ALLOWED_ROOT_FILES: &[&str] = &["settings.json", "settings.distrib.json", "testplan"];

/// Resource limits, in milliseconds for times and bytes for sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsSettings {
    #[serde(rename = "ExtraWallTime", default)]
    pub extra_wall_time: u64,
    #[serde(rename = "MemoryLimit", default = "default_memory_limit")]
    pub memory_limit: u64,
    #[serde(rename = "OutputLimit", default = "default_output_limit")]
    pub output_limit: u64,
    #[serde(rename = "OverallWallTimeLimit", default = "default_overall_wall_time_limit")]
    pub overall_wall_time_limit: u64,
    #[serde(rename = "StackLimit", default = "default_stack_limit")]
    pub stack_limit: u64,
    #[serde(rename = "TimeLimit", default = "default_time_limit")]
    pub time_limit: u64,
}

fn default_memory_limit() -> u64 {
    32 * 1024 * 1024
}

fn default_output_limit() -> u64 {
    10240
}

fn default_overall_wall_time_limit() -> u64 {
    60000
}

fn default_stack_limit() -> u64 {
    10 * 1024 * 1024
}

fn default_time_limit() -> u64 {
    1000
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            extra_wall_time: 0,
            memory_limit: default_memory_limit(),
            output_limit: default_output_limit(),
            overall_wall_time_limit: default_overall_wall_time_limit(),
            stack_limit: default_stack_limit(),
            time_limit: default_time_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSettings {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    #[serde(rename = "Cases")]
    pub cases: Vec<CaseSettings>,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSettings {
    #[serde(rename = "Limits", default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsSettings>,
    #[serde(rename = "Name", default = "default_validator_name")]
    pub name: String,
    #[serde(rename = "Tolerance", default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

fn default_validator_name() -> String {
    "token-caseless".to_string()
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            limits: None,
            name: default_validator_name(),
            tolerance: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InteractiveSettings {
    #[serde(rename = "Interfaces", default)]
    pub interfaces: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "LibinteractiveVersion", default)]
    pub libinteractive_version: String,
    #[serde(rename = "Main", default)]
    pub main: String,
    #[serde(rename = "ModuleName", default)]
    pub module_name: String,
    #[serde(rename = "ParentLang", default)]
    pub parent_lang: String,
}

/// The `settings.json` schema of record. Serialization goes through
/// [`canonical_json`], so field order here is the canonical key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemSettings {
    #[serde(rename = "Cases", default)]
    pub cases: Vec<GroupSettings>,
    #[serde(rename = "Interactive", default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<InteractiveSettings>,
    #[serde(rename = "Limits", default)]
    pub limits: LimitsSettings,
    #[serde(rename = "Slow", default)]
    pub slow: bool,
    #[serde(rename = "Title", default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "Validator", default)]
    pub validator: ValidatorSettings,
}

impl Default for ProblemSettings {
    fn default() -> Self {
        Self {
            cases: Vec::new(),
            interactive: None,
            limits: LimitsSettings::default(),
            slow: false,
            title: None,
            validator: ValidatorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistribInteractiveSettings {
    #[serde(rename = "Idl")]
    pub idl: String,
    #[serde(rename = "Main", default)]
    pub main: String,
    #[serde(rename = "ModuleName")]
    pub module_name: String,
    #[serde(rename = "ParentLang")]
    pub parent_lang: String,
}

/// The `settings.distrib.json` schema: the distributable subset of the
/// problem shown to contestants. Limits are copied from `settings.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DistribSettings {
    #[serde(rename = "Interactive", default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<DistribInteractiveSettings>,
    #[serde(rename = "Limits", default)]
    pub limits: LimitsSettings,
}

/// The one JSON encoder every settings blob goes through: pretty-printed,
/// stable key order, trailing newline. Tree OIDs stay stable across
/// rebuilds because nothing else ever serializes these files.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| Error::with_detail(ErrorCategory::JsonParseError, err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// The settings blob a problem gets when it doesn't carry one.
pub fn default_settings_json() -> Result<Vec<u8>> {
    canonical_json(&ProblemSettings::default())
}

#[derive(Debug, Clone)]
pub struct CanonicalizeOptions {
    pub accepts_submissions: bool,
    pub hard_wall_time_limit: Duration,
}

impl Default for CanonicalizeOptions {
    fn default() -> Self {
        Self {
            accepts_submissions: true,
            hard_wall_time_limit: OVERALL_WALL_TIME_HARD_LIMIT,
        }
    }
}

#[derive(Debug)]
pub struct CanonicalProblem {
    pub tree: Oid,
    pub settings: ProblemSettings,
}

fn bad_layout(detail: impl Into<String>) -> Error {
    Error::with_detail(ErrorCategory::ProblemBadLayout, detail)
}

fn is_valid_case_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_locale(code: &str) -> bool {
    let (language, region) = match code.split_once('-') {
        Some((language, region)) => (language, Some(region)),
        None => (code, None),
    };
    let language_ok = (2..=3).contains(&language.len())
        && language.chars().all(|c| c.is_ascii_lowercase());
    let region_ok = region.is_none_or(|r| r.len() == 2 && r.chars().all(|c| c.is_ascii_uppercase()));
    language_ok && region_ok
}

/// Validates a candidate problem tree and rewrites it into canonical form:
/// `settings.json` regenerated through the canonical encoder with cases
/// derived from `cases/`, testplan weights folded in and the file dropped,
/// `.out` files normalized to end in a newline, and interactive artifacts
/// compiled and spliced in.
pub fn canonicalize_problem_tree(
    repo: &Repository,
    tree: &Tree<'_>,
    compiler: &dyn InteractiveSettingsCompiler,
    options: &CanonicalizeOptions,
    deadline: &Deadline,
) -> Result<CanonicalProblem> {
    let contents = tree_contents(repo, tree, MAX_PROBLEM_BYTES)?;
    canonicalize_problem_contents(repo, contents, compiler, options, deadline)
}

pub fn canonicalize_problem_contents(
    repo: &Repository,
    contents: BTreeMap<String, Vec<u8>>,
    compiler: &dyn InteractiveSettingsCompiler,
    options: &CanonicalizeOptions,
    deadline: &Deadline,
) -> Result<CanonicalProblem> {
    if deadline.expired() {
        return Err(Error::Unpack("push deadline exceeded".to_string()));
    }

    validate_layout(&contents)?;
    enforce_size_limits(&contents)?;

    let mut settings: ProblemSettings = match contents.get("settings.json") {
        Some(raw) => serde_json::from_slice(raw).map_err(|err| {
            Error::with_detail(ErrorCategory::JsonParseError, format!("settings.json: {err}"))
        })?,
        None => ProblemSettings::default(),
    };
    let user_distrib: Option<DistribSettings> = match contents.get("settings.distrib.json") {
        Some(raw) => Some(serde_json::from_slice(raw).map_err(|err| {
            Error::with_detail(
                ErrorCategory::JsonParseError,
                format!("settings.distrib.json: {err}"),
            )
        })?),
        None => None,
    };

    validate_statements(&contents)?;
    let case_names = validate_cases(&contents, options.accepts_submissions)?;
    let weights = parse_testplan(&contents, &case_names)?;
    settings.cases = case_groups(&case_names, &weights);
    validate_validator(&contents, &settings)?;

    // Clamp before the limits are copied into settings.distrib.json.
    let hard_limit_ms = options.hard_wall_time_limit.as_millis() as u64;
    if settings.limits.overall_wall_time_limit > hard_limit_ms {
        settings.limits.overall_wall_time_limit = hard_limit_ms;
    }

    let mut canonical = contents.clone();
    canonical.remove("testplan");

    let interactive = compile_interactive(&contents, compiler, deadline)?;
    match interactive {
        Some((compiled_settings, generated, idl_name, main_name)) => {
            settings.interactive = Some(compiled_settings.clone());
            for (path, data) in generated {
                canonical.entry(path).or_insert(data);
            }
            let distrib = DistribSettings {
                interactive: Some(DistribInteractiveSettings {
                    idl: idl_name,
                    main: main_name,
                    module_name: compiled_settings.module_name.clone(),
                    parent_lang: compiled_settings.parent_lang.clone(),
                }),
                limits: settings.limits.clone(),
            };
            canonical.insert("settings.distrib.json".to_string(), canonical_json(&distrib)?);
        }
        None => {
            settings.interactive = None;
            if let Some(mut distrib) = user_distrib {
                distrib.limits = settings.limits.clone();
                canonical.insert("settings.distrib.json".to_string(), canonical_json(&distrib)?);
            }
        }
    }

    // Normalize expected outputs to end in a newline.
    for (path, data) in canonical.iter_mut() {
        if (path.starts_with("cases/") || path.starts_with("examples/"))
            && path.ends_with(".out")
            && data.last() != Some(&b'\n')
        {
            data.push(b'\n');
        }
    }

    canonical.insert("settings.json".to_string(), canonical_json(&settings)?);

    let tree = build_tree(repo, &canonical)?;
    Ok(CanonicalProblem { tree, settings })
}

fn validate_layout(contents: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    for path in contents.keys() {
        match path.split_once('/') {
            None => {
                if !ALLOWED_ROOT_FILES.contains(&path.as_str()) {
                    return Err(bad_layout(format!("invalid path '{path}'")));
                }
            }
            Some((directory, _)) => {
                if !ALLOWED_DIRECTORIES.contains(&directory) {
                    return Err(bad_layout(format!("invalid path '{path}'")));
                }
            }
        }
    }
    Ok(())
}

fn enforce_size_limits(contents: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let mut per_directory: BTreeMap<&str, u64> = BTreeMap::new();
    for (path, data) in contents {
        if let Some((directory, _)) = path.split_once('/') {
            *per_directory.entry(directory).or_default() += data.len() as u64;
        }
        if path.starts_with("solutions/") && data.len() as u64 > MAX_SOLUTION_FILE_BYTES {
            return Err(Error::with_detail(
                ErrorCategory::TooBig,
                format!("solution '{path}' exceeds {MAX_SOLUTION_FILE_BYTES} bytes"),
            ));
        }
    }
    for (directory, total) in per_directory {
        if total > MAX_DIRECTORY_BYTES {
            return Err(Error::with_detail(
                ErrorCategory::TooBig,
                format!("directory '{directory}' exceeds {MAX_DIRECTORY_BYTES} bytes"),
            ));
        }
    }
    Ok(())
}

fn validate_statements(contents: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let mut locales = BTreeSet::new();
    for path in contents.keys() {
        let Some(name) = path.strip_prefix("statements/") else {
            continue;
        };
        if let Some(locale) = name.strip_suffix(".markdown") {
            if name.contains('/') || !is_valid_locale(locale) {
                return Err(bad_layout(format!("invalid statement name '{path}'")));
            }
            locales.insert(locale.to_string());
        }
    }
    if locales.is_empty() {
        return Err(bad_layout("no statements found"));
    }
    if !locales.contains("es") && !locales.contains("en") {
        return Err(bad_layout("missing statement for a default language (es or en)"));
    }
    Ok(())
}

/// Validates the `(name.in, name.out)` pairing discipline for one case
/// directory. `examples/` sample cases follow the same rules as `cases/`.
fn validate_case_directory(
    contents: &BTreeMap<String, Vec<u8>>,
    prefix: &str,
) -> Result<Vec<String>> {
    let mut inputs = BTreeSet::new();
    let mut outputs = BTreeSet::new();
    for (path, data) in contents {
        let Some(name) = path.strip_prefix(prefix) else {
            continue;
        };
        let (case_name, is_input) = if let Some(stem) = name.strip_suffix(".in") {
            (stem, true)
        } else if let Some(stem) = name.strip_suffix(".out") {
            (stem, false)
        } else {
            return Err(bad_layout(format!("invalid case file '{path}'")));
        };
        if !is_valid_case_name(case_name) {
            return Err(bad_layout(format!("invalid case name '{case_name}'")));
        }
        if data.is_empty() {
            return Err(bad_layout(format!("case file '{path}' is empty")));
        }
        if is_input {
            inputs.insert(case_name.to_string());
        } else {
            outputs.insert(case_name.to_string());
        }
    }

    if let Some(name) = inputs.symmetric_difference(&outputs).next() {
        return Err(bad_layout(format!(
            "mismatched input and output for case '{name}'"
        )));
    }
    Ok(inputs.into_iter().collect())
}

fn validate_cases(
    contents: &BTreeMap<String, Vec<u8>>,
    accepts_submissions: bool,
) -> Result<Vec<String>> {
    validate_case_directory(contents, "examples/")?;
    let case_names = validate_case_directory(contents, "cases/")?;
    if accepts_submissions && case_names.is_empty() {
        return Err(bad_layout("problem has no cases"));
    }
    Ok(case_names)
}

fn parse_testplan(
    contents: &BTreeMap<String, Vec<u8>>,
    case_names: &[String],
) -> Result<BTreeMap<String, f64>> {
    let mut weights = BTreeMap::new();
    let Some(raw) = contents.get("testplan") else {
        return Ok(weights);
    };
    let text = std::str::from_utf8(raw)
        .map_err(|_| bad_layout("testplan is not valid UTF-8"))?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, weight) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| bad_layout(format!("invalid testplan entry '{line}'")))?;
        let weight: f64 = weight
            .trim()
            .parse()
            .map_err(|_| bad_layout(format!("invalid testplan entry '{line}'")))?;
        if !case_names.iter().any(|c| c == name) {
            return Err(bad_layout(format!(
                "testplan references unknown case '{name}'"
            )));
        }
        weights.insert(name.to_string(), weight);
    }
    Ok(weights)
}

fn case_groups(case_names: &[String], weights: &BTreeMap<String, f64>) -> Vec<GroupSettings> {
    case_names
        .iter()
        .map(|name| {
            let weight = weights.get(name).copied().unwrap_or(1.0);
            GroupSettings {
                cases: vec![CaseSettings {
                    name: name.clone(),
                    weight,
                }],
                name: name.clone(),
                weight,
            }
        })
        .collect()
}

fn validate_validator(
    contents: &BTreeMap<String, Vec<u8>>,
    settings: &ProblemSettings,
) -> Result<()> {
    if !VALIDATOR_NAMES.contains(&settings.validator.name.as_str()) {
        return Err(bad_layout(format!(
            "invalid validator name '{}'",
            settings.validator.name
        )));
    }

    let mut sources = Vec::new();
    for path in contents.keys() {
        let Some(name) = path.strip_prefix("validators/") else {
            continue;
        };
        if name
            .strip_prefix("validator.")
            .is_none_or(|ext| !VALIDATOR_EXTENSIONS.contains(&ext))
        {
            return Err(bad_layout(format!("invalid validator file '{path}'")));
        }
        sources.push(path.clone());
    }

    if settings.validator.name == "custom" {
        match sources.len() {
            0 => Err(bad_layout("problem with custom validator missing a validator")),
            1 => Ok(()),
            _ => Err(bad_layout("problem with more than one validator")),
        }
    } else if !sources.is_empty() {
        Err(bad_layout("problem with unused validator"))
    } else {
        Ok(())
    }
}

type InteractiveCompilation = (InteractiveSettings, BTreeMap<String, Vec<u8>>, String, String);

fn compile_interactive(
    contents: &BTreeMap<String, Vec<u8>>,
    compiler: &dyn InteractiveSettingsCompiler,
    deadline: &Deadline,
) -> Result<Option<InteractiveCompilation>> {
    let idls: Vec<&str> = contents
        .keys()
        .filter_map(|path| path.strip_prefix("interactive/"))
        .filter(|name| !name.contains('/') && name.ends_with(".idl"))
        .collect();
    if idls.is_empty() {
        return Ok(None);
    }
    if idls.len() > 1 {
        return Err(Error::with_detail(
            ErrorCategory::InteractiveBadLayout,
            "more than one .idl file",
        ));
    }
    let idl_name = idls[0].to_string();
    let module_name = idl_name
        .strip_suffix(".idl")
        .unwrap_or(&idl_name)
        .to_string();

    let mains: Vec<&str> = contents
        .keys()
        .filter_map(|path| path.strip_prefix("interactive/"))
        .filter(|name| {
            !name.contains('/')
                && name.starts_with("Main.")
                && !name.starts_with("Main.distrib.")
        })
        .collect();
    let main_name = match mains.as_slice() {
        [] => {
            return Err(Error::with_detail(
                ErrorCategory::InteractiveBadLayout,
                "missing interactive Main source",
            ));
        }
        [main] => (*main).to_string(),
        _ => {
            return Err(Error::with_detail(
                ErrorCategory::InteractiveBadLayout,
                "more than one interactive Main source",
            ));
        }
    };
    let parent_lang = main_name
        .strip_prefix("Main.")
        .unwrap_or(&main_name)
        .to_string();

    if deadline.expired() {
        return Err(Error::Unpack("push deadline exceeded".to_string()));
    }

    let idl = &contents[&format!("interactive/{idl_name}")];
    let main_source = &contents[&format!("interactive/{main_name}")];
    let compiled = compiler.compile(idl, &module_name, main_source, &parent_lang, deadline)?;
    Ok(Some((
        compiled.settings,
        compiled.files,
        idl_name,
        main_name,
    )))
}

/// Visibility-filtered projections of a canonical problem tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

fn is_public_path(path: &str) -> bool {
    path.starts_with("statements/")
        || path.starts_with("examples/")
        || path.starts_with("interactive/examples/")
        || path == "settings.distrib.json"
        || (path.starts_with("interactive/") && path.contains(".distrib."))
}

fn is_protected_path(path: &str) -> bool {
    is_public_path(path) || path.starts_with("cases/")
}

/// Builds the tree a visibility sibling reference should carry. `Private`
/// is the canonical tree itself.
pub fn visibility_tree(
    repo: &Repository,
    canonical_tree: &Tree<'_>,
    visibility: Visibility,
) -> Result<Oid> {
    if visibility == Visibility::Private {
        return Ok(canonical_tree.id());
    }
    let contents = tree_contents(repo, canonical_tree, MAX_PROBLEM_BYTES)?;
    let filter: fn(&str) -> bool = match visibility {
        Visibility::Public => is_public_path,
        Visibility::Protected => is_protected_path,
        Visibility::Private => unreachable!(),
    };
    let filtered: BTreeMap<String, Vec<u8>> = contents
        .into_iter()
        .filter(|(path, _)| filter(path))
        .collect();
    build_tree(repo, &filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interactive::FakeInteractiveSettingsCompiler;

    fn contents(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(path, data)| (path.to_string(), data.as_bytes().to_vec()))
            .collect()
    }

    fn canonicalize(
        entries: &[(&str, &str)],
    ) -> Result<(Repository, tempfile::TempDir, CanonicalProblem)> {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        let compiler = FakeInteractiveSettingsCompiler {
            settings: None,
            error: Some("unsupported".to_string()),
        };
        let result = canonicalize_problem_contents(
            &repo,
            contents(entries),
            &compiler,
            &CanonicalizeOptions::default(),
            &Deadline::new(Duration::from_secs(60)),
        )?;
        Ok((repo, dir, result))
    }

    const BASIC: &[(&str, &str)] = &[
        ("cases/0.in", "1 2"),
        ("cases/0.out", "3"),
        ("statements/es.markdown", "Sumas"),
    ];

    #[test]
    fn test_default_settings_round_trip() {
        let encoded = default_settings_json().unwrap();
        let parsed: ProblemSettings = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed, ProblemSettings::default());
        assert_eq!(canonical_json(&parsed).unwrap(), encoded);
        assert_eq!(parsed.validator.name, "token-caseless");
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let (repo, _dir, first) = canonicalize(BASIC).unwrap();
        let tree = repo.find_tree(first.tree).unwrap();
        let compiler = FakeInteractiveSettingsCompiler::default();
        let second = canonicalize_problem_tree(
            &repo,
            &tree,
            &compiler,
            &CanonicalizeOptions::default(),
            &Deadline::new(Duration::from_secs(60)),
        )
        .unwrap();
        assert_eq!(first.tree, second.tree);
    }

    #[test]
    fn test_derives_cases_and_normalizes_outputs() {
        let (repo, _dir, canonical) = canonicalize(BASIC).unwrap();
        assert_eq!(canonical.settings.cases.len(), 1);
        assert_eq!(canonical.settings.cases[0].name, "0");
        assert_eq!(canonical.settings.cases[0].weight, 1.0);

        let tree = repo.find_tree(canonical.tree).unwrap();
        let flattened = tree_contents(&repo, &tree, u64::MAX).unwrap();
        assert_eq!(flattened["cases/0.out"], b"3\n");
    }

    #[test]
    fn test_testplan_folds_weights_and_is_dropped() {
        let (repo, _dir, canonical) = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/es.markdown", "Sumas"),
            ("testplan", "0 1"),
        ])
        .unwrap();
        assert_eq!(canonical.settings.cases[0].weight, 1.0);
        let tree = repo.find_tree(canonical.tree).unwrap();
        assert!(tree.get_name("testplan").is_none());

        let (_repo, _dir2, without) = canonicalize(BASIC).unwrap();
        assert_eq!(canonical.tree, without.tree);
    }

    #[test]
    fn test_testplan_unknown_case() {
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/es.markdown", "Sumas"),
            ("testplan", "missing 1"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);
    }

    #[test]
    fn test_unpaired_case() {
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("statements/es.markdown", "Sumas"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);
    }

    #[test]
    fn test_examples_follow_case_rules() {
        // Unpaired sample input.
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("examples/sample.in", "1 1"),
            ("statements/es.markdown", "Sumas"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);

        // Empty sample file.
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("examples/sample.in", ""),
            ("examples/sample.out", "2"),
            ("statements/es.markdown", "Sumas"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);

        // Sample name outside the case-name charset.
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("examples/sam ple.in", "1 1"),
            ("examples/sam ple.out", "2"),
            ("statements/es.markdown", "Sumas"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);

        // Well-formed samples pass and get the same `.out` normalization.
        let (repo, _dir, canonical) = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("examples/sample.in", "1 1"),
            ("examples/sample.out", "2"),
            ("statements/es.markdown", "Sumas"),
        ])
        .unwrap();
        let tree = repo.find_tree(canonical.tree).unwrap();
        let flattened = tree_contents(&repo, &tree, u64::MAX).unwrap();
        assert_eq!(flattened["examples/sample.out"], b"2\n");
        // Samples do not contribute to the graded case groups.
        assert_eq!(canonical.settings.cases.len(), 1);
    }

    #[test]
    fn test_missing_default_statement_language() {
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/pt.markdown", "Somas"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);
    }

    #[test]
    fn test_forbidden_path() {
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/es.markdown", "Sumas"),
            (".gitignore", "*.o"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);
    }

    #[test]
    fn test_custom_validator_consistency() {
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/es.markdown", "Sumas"),
            ("validators/validator.py", "print('ok')"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::ProblemBadLayout);

        let settings = ProblemSettings {
            validator: ValidatorSettings {
                name: "custom".to_string(),
                ..ValidatorSettings::default()
            },
            ..ProblemSettings::default()
        };
        let settings_json = String::from_utf8(canonical_json(&settings).unwrap()).unwrap();
        let (_repo, _dir, canonical) = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/es.markdown", "Sumas"),
            ("settings.json", &settings_json),
            ("validators/validator.py", "print('ok')"),
        ])
        .unwrap();
        assert_eq!(canonical.settings.validator.name, "custom");
    }

    #[test]
    fn test_malformed_settings_json() {
        let err = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/es.markdown", "Sumas"),
            ("settings.json", "invalid json"),
        ])
        .err().unwrap();
        assert_eq!(err.category(), ErrorCategory::JsonParseError);
    }

    #[test]
    fn test_wall_time_clamped() {
        let settings = ProblemSettings {
            limits: LimitsSettings {
                overall_wall_time_limit: 600_000,
                ..LimitsSettings::default()
            },
            ..ProblemSettings::default()
        };
        let settings_json = String::from_utf8(canonical_json(&settings).unwrap()).unwrap();
        let (_repo, _dir, canonical) = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("statements/es.markdown", "Sumas"),
            ("settings.json", &settings_json),
        ])
        .unwrap();
        assert_eq!(canonical.settings.limits.overall_wall_time_limit, 60_000);
    }

    #[test]
    fn test_visibility_projections() {
        let (repo, _dir, canonical) = canonicalize(&[
            ("cases/0.in", "1 2"),
            ("cases/0.out", "3"),
            ("examples/sample.in", "1 1"),
            ("examples/sample.out", "2"),
            ("solutions/es.markdown", "Sume usted"),
            ("statements/es.markdown", "Sumas"),
        ])
        .unwrap();
        let tree = repo.find_tree(canonical.tree).unwrap();

        let public = repo
            .find_tree(visibility_tree(&repo, &tree, Visibility::Public).unwrap())
            .unwrap();
        let public_contents = tree_contents(&repo, &public, u64::MAX).unwrap();
        assert!(public_contents.contains_key("statements/es.markdown"));
        assert!(public_contents.contains_key("examples/sample.in"));
        assert!(!public_contents.contains_key("cases/0.in"));
        assert!(!public_contents.contains_key("solutions/es.markdown"));

        let protected = repo
            .find_tree(visibility_tree(&repo, &tree, Visibility::Protected).unwrap())
            .unwrap();
        let protected_contents = tree_contents(&repo, &protected, u64::MAX).unwrap();
        assert!(protected_contents.contains_key("cases/0.in"));
        assert!(!protected_contents.contains_key("solutions/es.markdown"));

        assert_eq!(
            visibility_tree(&repo, &tree, Visibility::Private).unwrap(),
            canonical.tree
        );
    }
}
