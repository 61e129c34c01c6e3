use foreman_core::config::Config;
use foreman_core::step::StepCatalog;
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

/// One startup check. Everything here is cheap and read-only; the point is
/// to fail before a tmux session or an LLM call ever happens.
#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            detail: detail.into(),
        }
    }
}

pub fn run_checks(
    project: &Path,
    config: &Config,
    catalog: &StepCatalog,
    vars: &BTreeMap<String, String>,
) -> Vec<Check> {
    let mut checks = Vec::new();

    for binary in ["tmux", "git"] {
        checks.push(match which::which(binary) {
            Ok(path) => Check::pass("binary", format!("{binary} at {}", path.display())),
            Err(_) => Check::fail("binary", format!("{binary} not found on PATH")),
        });
    }

    checks.push(if project.join(".git").exists() {
        Check::pass("work tree", format!("{} is a git repository", project.display()))
    } else {
        Check::fail(
            "work tree",
            format!("{} is not a git repository", project.display()),
        )
    });

    for provider in &config.providers {
        checks.push(match provider.resolve_keys() {
            Ok(keys) => Check::pass(
                "credentials",
                format!("{}: {} key(s) resolved", provider.name, keys.len()),
            ),
            Err(e) => Check::fail("credentials", e.to_string()),
        });
    }

    checks.push(match catalog.check_vars(vars) {
        Ok(()) => Check::pass(
            "step catalog",
            format!("{} steps, all placeholders bound", catalog.len()),
        ),
        Err(e) => Check::fail("step catalog", e.to_string()),
    });

    checks
}

pub fn print_report(checks: &[Check]) {
    for check in checks {
        let mark = if check.ok { "ok " } else { "FAIL" };
        println!("  [{mark}] {:<12} {}", check.name, check.detail);
    }
}

pub fn all_passed(checks: &[Check]) -> bool {
    checks.iter().all(|c| c.ok)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
