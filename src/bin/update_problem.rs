use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use git2::Repository;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use omegaup_gitserver::interactive::LibinteractiveCompiler;
use omegaup_gitserver::problem::ProblemSettings;
use omegaup_gitserver::repository::{has_version_marker, init_repository, Lockfile};
use omegaup_gitserver::updater::{
    commit_blobs, commit_settings, commit_zip_file, UpdateResult,
};
use omegaup_gitserver::ziputil::ZipUpdateMask;

#[derive(Parser)]
#[command(name = "omegaup-update-problem")]
#[command(about = "Updates an omegaUp problem repository", long_about = None)]
struct Cli {
    /// Author of the commit
    #[arg(long)]
    author: String,

    /// Commit message
    #[arg(long = "commit-message")]
    commit_message: String,

    /// Path of the git repository
    #[arg(long = "repository-path")]
    repository_path: PathBuf,

    /// JSON-encoded ProblemSettings
    #[arg(long = "problem-settings")]
    problem_settings: Option<String>,

    /// Path of the .zip file
    #[arg(long = "zip-path")]
    zip_path: Option<PathBuf>,

    /// Update cases
    #[arg(long = "update-cases", default_value_t = true, action = clap::ArgAction::Set)]
    update_cases: bool,

    /// Update statements
    #[arg(long = "update-statements", default_value_t = true, action = clap::ArgAction::Set)]
    update_statements: bool,

    /// Problem accepts submissions
    #[arg(long = "accepts-submissions", default_value_t = true, action = clap::ArgAction::Set)]
    accepts_submissions: bool,

    /// Path of libinteractive.jar
    #[arg(
        long = "libinteractive-path",
        default_value = "/usr/share/java/libinteractive.jar"
    )]
    libinteractive_path: PathBuf,

    /// JSON list of {path, contents_path} blob updates
    #[arg(long = "blob-update")]
    blob_update: Option<String>,
}

#[derive(serde::Deserialize)]
struct BlobUpdate {
    path: String,
    contents_path: PathBuf,
}

fn print_result(result: &UpdateResult) {
    match serde_json::to_string_pretty(result) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => error!("failed to render result: {err}"),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.author.is_empty() {
        error!("author cannot be empty. Please specify one with --author");
        std::process::exit(1);
    }
    if cli.commit_message.is_empty() {
        error!("commit message cannot be empty. Please specify one with --commit-message");
        std::process::exit(1);
    }
    if cli.repository_path.as_os_str().is_empty() {
        error!("repository path cannot be empty. Please specify one with --repository-path");
        std::process::exit(1);
    }

    if cli.zip_path.is_none() && cli.blob_update.is_none() && cli.problem_settings.is_none() {
        error!("-zip-path, -blob-update, and -problem-settings cannot be simultaneously empty.");
        std::process::exit(1);
    }
    if cli.blob_update.is_some() && (cli.zip_path.is_some() || cli.problem_settings.is_some()) {
        error!("-blob-update cannot be combined with -zip-path or -problem-settings.");
        std::process::exit(1);
    }

    let settings: Option<ProblemSettings> = match &cli.problem_settings {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(settings) => Some(settings),
            Err(err) => {
                error!("Failed to parse -problem-settings: {err}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    // A missing repository is bootstrapped in a temporary sibling directory
    // and renamed into place only if the update succeeds.
    let mut staging_dir = None;
    let repo_path = if cli.repository_path.exists() {
        if !has_version_marker(&cli.repository_path) {
            print_result(&UpdateResult::error("omegaup-update-problem-old-version"));
            std::process::exit(1);
        }
        cli.repository_path.clone()
    } else {
        let parent = cli
            .repository_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        let staging = match tempfile::Builder::new()
            .prefix("repository")
            .tempdir_in(parent)
        {
            Ok(staging) => staging,
            Err(err) => {
                error!("Failed to create temporary directory: {err}");
                std::process::exit(1);
            }
        };
        if let Err(err) = init_repository(staging.path()) {
            error!("Failed to init bare repository: {err}");
            std::process::exit(1);
        }
        let path = staging.path().to_path_buf();
        staging_dir = Some(staging);
        path
    };

    let repo = match Repository::open(&repo_path) {
        Ok(repo) => repo,
        Err(err) => {
            error!("failed to open repository: {err}");
            std::process::exit(1);
        }
    };

    let mut lockfile = Lockfile::new(&repo_path);
    match lockfile.try_lock_exclusive() {
        Ok(true) => {}
        Ok(false) => {
            info!("Waiting for the lockfile");
            if let Err(err) = lockfile.lock_exclusive() {
                error!("Failed to acquire the lockfile: {err}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            error!("Failed to acquire the lockfile: {err}");
            std::process::exit(1);
        }
    }

    let compiler = Arc::new(LibinteractiveCompiler {
        jar_path: cli.libinteractive_path.clone(),
    });

    let outcome = if let Some(zip_path) = &cli.zip_path {
        let mask = ZipUpdateMask {
            cases: cli.update_cases,
            statements: cli.update_statements,
        };
        commit_zip_file(
            &repo,
            zip_path,
            &cli.author,
            &cli.commit_message,
            settings.as_ref(),
            mask,
            cli.accepts_submissions,
            compiler,
        )
    } else if let Some(raw) = &cli.blob_update {
        let updates: Vec<BlobUpdate> = match serde_json::from_str(raw) {
            Ok(updates) => updates,
            Err(err) => {
                error!("Failed to parse -blob-update: {err}");
                std::process::exit(1);
            }
        };
        let mut contents = BTreeMap::new();
        for update in updates {
            match std::fs::read(&update.contents_path) {
                Ok(data) => {
                    contents.insert(update.path, data);
                }
                Err(err) => {
                    error!(
                        "failed to open blob contents at {}: {err}",
                        update.contents_path.display()
                    );
                    std::process::exit(1);
                }
            }
        }
        commit_blobs(&repo, &cli.author, &cli.commit_message, &contents, compiler)
    } else {
        commit_settings(
            &repo,
            &cli.author,
            &cli.commit_message,
            settings.as_ref().expect("validated above"),
            compiler,
        )
    };

    let result = match outcome {
        Ok(result) => {
            if let Some(staging) = staging_dir {
                drop(repo);
                let staging_path = staging.keep();
                if let Err(err) = std::fs::rename(&staging_path, &cli.repository_path) {
                    error!("Failed to commit the write to the repository: {err}");
                    UpdateResult::error(err.to_string())
                } else {
                    result
                }
            } else {
                result
            }
        }
        Err(err) => UpdateResult::error(err.wire_reason()),
    };

    print_result(&result);
    if result.status != "ok" {
        std::process::exit(1);
    }
}
