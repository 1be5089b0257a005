//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN_NAME: &str = "defyflash";

fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Detect the user's shell from `$SHELL`, or PowerShell on Windows.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path).file_name()?.to_str()?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where a completion script for `shell` goes under the given base dirs.
fn install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion/completions")
            .join(BIN_NAME),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish/completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish/lib")
            .join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => dirs
            .config_dir()
            .join("powershell/completions")
            .join(format!("{BIN_NAME}.ps1")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(shell) => shell,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             defyflash completions --install bash",
        )?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, &dirs)?;

    let mut script = Vec::new();
    render(shell, &mut script);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );

    match shell {
        Shell::Zsh => ensure_zsh_fpath(dirs.home_dir())?,
        Shell::Bash => eprintln!(
            "To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::PowerShell => eprintln!(
            "Add this to your PowerShell profile: {}",
            style(format!(". {}", path.display())).cyan()
        ),
        _ => eprintln!("Completions load on the next shell session."),
    }

    Ok(())
}

/// Make sure `~/.zfunc` is on zsh's `fpath`.
fn ensure_zsh_fpath(home: &Path) -> Result<()> {
    const FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

    let zshrc = home.join(".zshrc");
    let present = fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(FPATH_LINE));
    if !present {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&zshrc)
            .with_context(|| format!("Failed to update {}", zshrc.display()))?;
        writeln!(file, "\n# {BIN_NAME} completions")?;
        writeln!(file, "{FPATH_LINE}")?;
        writeln!(file, "autoload -Uz compinit && compinit")?;
        eprintln!(
            "{} Added fpath to {}",
            style("✓").green().bold(),
            style(zshrc.display()).yellow()
        );
    }
    eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("/usr/bin/pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("/usr/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_paths_name_binary() {
        let Some(dirs) = BaseDirs::new() else {
            return;
        };
        let bash = install_path(Shell::Bash, &dirs).unwrap();
        assert!(bash.ends_with("bash-completion/completions/defyflash"));

        let zsh = install_path(Shell::Zsh, &dirs).unwrap();
        assert!(zsh.ends_with(".zfunc/_defyflash"));

        let fish = install_path(Shell::Fish, &dirs).unwrap();
        assert!(fish.ends_with("fish/completions/defyflash.fish"));
    }

    #[test]
    fn test_render_scripts() {
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish, Shell::PowerShell, Shell::Elvish] {
            let mut buf = Vec::new();
            render(shell, &mut buf);
            let script = String::from_utf8(buf).unwrap();
            assert!(script.contains(BIN_NAME), "{shell:?} script names the binary");
        }
    }

    #[test]
    fn test_zsh_fpath_appended_once() {
        let home = tempfile::tempdir().unwrap();
        ensure_zsh_fpath(home.path()).unwrap();
        ensure_zsh_fpath(home.path()).unwrap();

        let content = fs::read_to_string(home.path().join(".zshrc")).unwrap();
        assert_eq!(content.matches("fpath=(~/.zfunc $fpath)").count(), 1);
    }
}
