//! Interactive setup and configuration
//!
//! Prompts re-ask until the answer validates; an empty answer keeps the
//! value shown in brackets. EOF aborts without saving.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Result};
use ipcert_common::config::{Config, KeySize, WebServerPreference};
use ipcert_common::orchestrator::RawRequest;
use ipcert_common::validation::{validate_email, validate_ip, validate_path, PathPolicy};

use crate::commands::{self, Context};
use crate::output::{display_info, display_section, display_success};

/// First-time setup: settings, then optionally a certificate and renewal jobs
pub fn setup(ctx: &Context) -> Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();

    display_section("IPCERT SETUP");
    let config = edit_and_save(ctx, &mut input, &mut output)?;

    if confirm(&mut input, &mut output, "Request a certificate now?", true)? {
        let ip = ask(&mut input, &mut output, "Public IP address", None, |raw| {
            validate_ip(raw).map(|_| ()).map_err(|e| e.to_string())
        })?;
        let raw = RawRequest {
            ip,
            email: config.certificate.email.clone().unwrap_or_default(),
            webroot: config.certificate.webroot.clone(),
        };
        commands::issue_with(ctx, &config, &raw)?;

        let install_jobs = config.renewal.auto_setup
            || confirm(&mut input, &mut output, "Install automatic renewal?", true)?;
        if install_jobs {
            commands::setup_renewal(ctx)?;
        }
    } else {
        display_info("Request a certificate later with `ipcertctl -i <IP>`");
    }
    Ok(())
}

/// Edit and save the configuration only
pub fn configure(ctx: &Context) -> Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();

    display_section("IPCERT CONFIGURATION");
    edit_and_save(ctx, &mut input, &mut output)?;
    Ok(())
}

fn edit_and_save(ctx: &Context, input: &mut dyn BufRead, output: &mut dyn Write) -> Result<Config> {
    let current = ctx.config()?;
    let edited = prompt_settings(input, output, &current)?;
    if edited == current && ctx.store.exists() {
        display_info("No changes");
        return Ok(edited);
    }
    ctx.store.save(&edited, &ctx.backups(&current))?;
    display_success(&format!("Configuration saved to {}", ctx.store.path().display()));
    Ok(edited)
}

/// Ask for every user-facing setting, starting from `current`
pub fn prompt_settings(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    current: &Config,
) -> Result<Config> {
    let mut config = current.clone();

    let email = ask(
        input,
        output,
        "Contact email",
        current.certificate.email.as_deref(),
        |raw| validate_email(raw).map(|_| ()).map_err(|e| e.to_string()),
    )?;
    config.certificate.email = Some(email);

    config.certificate.webroot = ask(
        input,
        output,
        "Webroot",
        Some(&current.certificate.webroot),
        |raw| {
            validate_path(raw, PathPolicy::SystemAbsolute)
                .map(|_| ())
                .map_err(|e| e.to_string())
        },
    )?;

    let bits = current.certificate.key_size.bits().to_string();
    let key_size = ask(input, output, "RSA key size (2048/4096)", Some(&bits), |raw| {
        parse_key_size(raw).map(|_| ())
    })?;
    config.certificate.key_size = parse_key_size(&key_size).unwrap_or(current.certificate.key_size);

    let server = ask(
        input,
        output,
        "Web server (auto/nginx/apache/standalone)",
        Some(current.certificate.web_server.as_str()),
        |raw| parse_web_server(raw).map(|_| ()),
    )?;
    config.certificate.web_server =
        parse_web_server(&server).unwrap_or(current.certificate.web_server);

    config.renewal.auto_setup = confirm(
        input,
        output,
        "Install renewal jobs automatically after issuing?",
        current.renewal.auto_setup,
    )?;

    Ok(config)
}

fn parse_key_size(raw: &str) -> Result<KeySize, String> {
    let bits: u32 = raw.trim().parse().map_err(|_| "enter 2048 or 4096".to_string())?;
    KeySize::try_from(bits)
}

fn parse_web_server(raw: &str) -> Result<WebServerPreference, String> {
    match raw.trim().to_lowercase().as_str() {
        "auto" => Ok(WebServerPreference::Auto),
        "nginx" => Ok(WebServerPreference::Nginx),
        "apache" | "apache2" | "httpd" => Ok(WebServerPreference::Apache),
        "standalone" => Ok(WebServerPreference::Standalone),
        other => Err(format!("unknown web server '{}'", other)),
    }
}

fn read_answer(input: &mut dyn BufRead) -> Result<String> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("input closed, nothing saved");
    }
    Ok(line.trim().to_string())
}

/// Prompt until `check` accepts the answer (or the default, on empty input)
fn ask(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    label: &str,
    default: Option<&str>,
    check: impl Fn(&str) -> Result<(), String>,
) -> Result<String> {
    loop {
        match default {
            Some(value) => write!(output, "{} [{}]: ", label, value)?,
            None => write!(output, "{}: ", label)?,
        }
        output.flush()?;

        let answer = read_answer(input)?;
        let answer = match (answer.is_empty(), default) {
            (true, Some(value)) => value.to_string(),
            (true, None) => {
                writeln!(output, "  a value is required")?;
                continue;
            }
            (false, _) => answer,
        };
        match check(&answer) {
            Ok(()) => return Ok(answer),
            Err(reason) => writeln!(output, "  {}", reason)?,
        }
    }
}

fn confirm(input: &mut dyn BufRead, output: &mut dyn Write, question: &str, default: bool) -> Result<bool> {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    loop {
        write!(output, "{} {}: ", question, hint)?;
        output.flush()?;
        match read_answer(input)?.to_lowercase().as_str() {
            "" => return Ok(default),
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => writeln!(output, "  answer y or n")?,
        }
    }
}
