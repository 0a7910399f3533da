//! Terminal output - plain ASCII markers, colour only as emphasis

use ipcert_common::RunReport;
use owo_colors::OwoColorize;

pub fn display_success(message: &str) {
    println!();
    println!("[OK] {}", message.green());
    println!();
}

pub fn display_info(message: &str) {
    println!("[INFO] {}", message);
}

pub fn display_warning(message: &str) {
    println!("[WARNING] {}", message.yellow());
}

/// Concise error for the operator; details live in the error log
pub fn display_error(message: &str) {
    eprintln!();
    eprintln!("[ERROR] {}", message.red());
    eprintln!();
}

/// Section header such as `[CERTBOT]`
pub fn display_section(title: &str) {
    println!();
    println!("{}", format!("[{}]", title).bold());
}

/// `  key: value` line inside a section
pub fn display_field(key: &str, value: &str) {
    println!("  {:<18} {}", format!("{}:", key), value);
}

/// Summary printed at the end of mutating commands
pub fn display_report(report: &RunReport) {
    if report.error_count() == 0 && report.warning_count() == 0 && report.suggestions().is_empty() {
        return;
    }
    println!();
    println!(
        "Summary: {} error(s), {} warning(s)",
        report.error_count(),
        report.warning_count()
    );
    for error in report.errors() {
        println!("  [ERROR] {}", error.red());
    }
    for warning in report.warnings() {
        println!("  [WARNING] {}", warning.yellow());
    }
    if !report.suggestions().is_empty() {
        println!();
        println!("[NEXT STEPS]");
        for suggestion in report.suggestions() {
            println!("  * {}", suggestion);
        }
    }
}
