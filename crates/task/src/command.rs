//! Command resolution: marker expansion, interpreter injection and the
//! working directory check

use isorun_core::{
    Error, Result, BOT_FILE_MARKER, EXECUTABLE_SUFFIX, EXECUTABLE_SUFFIX_MARKER, OUTDIR_MARKER,
};
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR};

/// Values substituted for the command-line markers
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerContext<'a> {
    /// Output directory; only set when outputs can be uploaded
    pub out_dir: Option<&'a Path>,
    pub bot_file: Option<&'a Path>,
}

/// Expand the markers in every token.
///
/// The output directory marker is an error without an output directory. A
/// missing bot file only warns and leaves its marker in place.
pub fn expand_markers(tokens: &[String], ctx: &MarkerContext<'_>) -> Result<Vec<String>> {
    tokens.iter().map(|token| expand_token(token, ctx)).collect()
}

fn expand_token(token: &str, ctx: &MarkerContext<'_>) -> Result<String> {
    let mut expanded = token.to_string();

    if expanded.contains(OUTDIR_MARKER) {
        let out_dir = ctx.out_dir.ok_or_else(|| {
            Error::validation(format!(
                "'{OUTDIR_MARKER}' requires a store to upload outputs to"
            ))
        })?;
        expanded = expanded.replace(OUTDIR_MARKER, &out_dir.to_string_lossy());
        expanded = expanded.replace(['/', '\\'], MAIN_SEPARATOR_STR);
    }

    if expanded.contains(EXECUTABLE_SUFFIX_MARKER) {
        expanded = expanded.replace(EXECUTABLE_SUFFIX_MARKER, EXECUTABLE_SUFFIX);
    }

    if expanded.contains(BOT_FILE_MARKER) {
        match ctx.bot_file {
            Some(bot_file) => {
                expanded = expanded.replace(BOT_FILE_MARKER, &bot_file.to_string_lossy());
            }
            None => {
                tracing::warn!(token = %token, "no bot file configured, leaving marker unexpanded");
            }
        }
    }

    Ok(expanded)
}

/// Run scripts through their interpreter so they work without an exec bit
pub fn inject_interpreter(mut command: Vec<String>) -> Vec<String> {
    let Some(first) = command.first() else {
        return command;
    };
    let interpreter = if first.ends_with(".py") {
        Some(
            which::which("python3")
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "python3".to_string()),
        )
    } else if first.ends_with(".sh") {
        Some("sh".to_string())
    } else {
        None
    };
    if let Some(interpreter) = interpreter {
        tracing::debug!(script = %first, interpreter = %interpreter, "injecting interpreter");
        command.insert(0, interpreter);
    }
    command
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent.
///
/// Returns `None` when `..` would climb above the start of the path.
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.iter().collect())
}

/// Resolve the working directory inside `run_dir`, rejecting escapes
pub fn resolve_cwd(run_dir: &Path, relative_cwd: Option<&str>) -> Result<PathBuf> {
    let Some(relative) = relative_cwd.filter(|r| !r.is_empty()) else {
        return Ok(run_dir.to_path_buf());
    };
    let normalized = normalize_relative(Path::new(relative)).ok_or_else(|| {
        Error::validation(format!(
            "relative_cwd '{relative}' escapes the run directory"
        ))
    })?;
    Ok(run_dir.join(normalized))
}

/// Build the final command line from the request and the bundle
pub fn resolve_command(
    explicit: &[String],
    from_bundle: &[String],
    extra_args: &[String],
    ctx: &MarkerContext<'_>,
) -> Result<Vec<String>> {
    let base: Vec<String> = if explicit.is_empty() {
        from_bundle.iter().chain(extra_args).cloned().collect()
    } else {
        explicit.to_vec()
    };
    if base.is_empty() {
        return Err(Error::validation("no command to run"));
    }
    let expanded = expand_markers(&base, ctx)?;
    Ok(inject_interpreter(expanded))
}
