//! Keep only listeners that look like development servers.

use super::DiscoveredProcess;

/// Editor helpers that listen on ports but are never interesting.
const IGNORE_PATTERNS: &[&str] = &[
    "/.cursor/",
    "cursor.app",
    "cursor-server",
    "/.vscode/",
    "code helper",
    "com.microsoft.vscode",
];

const DEV_PATTERNS: &[&str] = &[
    "node", "npm", "yarn", "pnpm", "python", "ruby", "rails", "go", "java", "mvn", "gradle",
    "cargo", "rust", "php", "laravel", "symfony", "dotnet", "flask", "django", "fastapi",
    "uvicorn", "gunicorn", "express", "next", "nuxt", "vite", "webpack", "parcel", "gulp",
    "deno", "bun", "rspec", "pytest", "jest", "vitest",
];

/// Substring match against the lowercased command line; ignore list first.
pub fn is_dev_process(process: &DiscoveredProcess) -> bool {
    let command = process.command.to_lowercase();
    if IGNORE_PATTERNS.iter().any(|p| command.contains(p)) {
        return false;
    }
    DEV_PATTERNS.iter().any(|p| command.contains(p))
}

pub fn retain_dev_processes(processes: &mut Vec<DiscoveredProcess>) {
    let before = processes.len();
    processes.retain(is_dev_process);
    tracing::debug!("Dev filter kept {} of {} listeners", processes.len(), before);
}
