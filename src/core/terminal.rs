use console::{Emoji, style};

use crate::core::schedule::DispatchSummary;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_link(label: &str, url: &str) {
    println!(
        "  {} {}: {}",
        GLOBE,
        style(label).bold(),
        style(url).underlined().cyan()
    );
}

pub fn print_banner() {
    println!();
    println!(
        "{} {}",
        ROCKET,
        style("funnel-swiper").bold().magenta()
    );
    println!(
        "   {}\n",
        style("Walks funnels so you don't have to.").dim()
    );
}

pub fn print_dispatch_summary(summary: &DispatchSummary) {
    print_status("Checked", &summary.jobs_checked.to_string());
    print_status("Started", &style(summary.jobs_started).green().to_string());
    let errored = if summary.jobs_errored > 0 {
        style(summary.jobs_errored).red().to_string()
    } else {
        summary.jobs_errored.to_string()
    };
    print_status("Errored", &errored);
}

pub fn print_goodbye() {
    println!(
        "\n{} {}",
        SPARKLE,
        style("funnel-swiper stopped. See you next time!")
            .bold()
            .cyan()
    );
}
