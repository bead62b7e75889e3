//! Environment block sent as the system instruction of every request.
//!
//! The block pins the model to the machine's notion of "now" (local and UTC
//! time, timezone), plus OS, user and locale. It is captured again on every
//! call; only the freshness of the timestamp makes it worth sending.

use chrono::{DateTime, Local, Utc};
use std::env;
use std::fmt::Write;

/// Source of the system instruction attached to each request.
pub trait ContextProvider {
    fn system_instruction(&self) -> String;
}

/// Reads clock, OS, user and locale from the running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvironmentContext;

impl ContextProvider for EnvironmentContext {
    fn system_instruction(&self) -> String {
        let text = SystemContext::capture().render();
        tracing::debug!(chars = text.len(), "generated system instruction");
        text
    }
}

/// One snapshot of the ambient machine state.
#[derive(Debug, Clone)]
pub struct SystemContext {
    pub local: DateTime<Local>,
    pub utc: DateTime<Utc>,
    pub timezone: String,
    pub os_family: String,
    pub os_version: String,
    pub machine_name: String,
    pub user_name: String,
    pub locale: Locale,
}

impl SystemContext {
    pub fn capture() -> Self {
        let utc = Utc::now();
        Self {
            local: utc.with_timezone(&Local),
            utc,
            timezone: timezone_name(),
            os_family: os_family().to_string(),
            os_version: os_version(),
            machine_name: machine_name(),
            user_name: first_env(&["USER", "USERNAME", "LOGNAME"]).unwrap_or_else(|| "unknown".into()),
            locale: Locale::from_env(),
        }
    }

    pub fn render(&self) -> String {
        let mut s = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_to(&mut s);
        s
    }

    fn write_to(&self, s: &mut String) -> std::fmt::Result {
        writeln!(s, "### SYSTEM ENVIRONMENT CONTEXT ###")?;
        writeln!(
            s,
            "You are running locally on the user's machine. The following context is accurate and defines your current reality:"
        )?;
        writeln!(s)?;

        writeln!(s, "[TEMPORAL DATA]")?;
        writeln!(s, "Local Time: {}", self.local.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(s, "Day of Week: {}", self.local.format("%A"))?;
        writeln!(s, "UTC Time: {} Z", self.utc.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(s, "Timezone: {} (Offset: {})", self.timezone, self.local.format("%:z"))?;
        writeln!(s)?;

        writeln!(s, "[SYSTEM DATA]")?;
        writeln!(s, "OS Platform: {}", self.os_family)?;
        writeln!(s, "OS Version: {}", self.os_version)?;
        writeln!(s, "Machine Name: {}", self.machine_name)?;
        writeln!(s, "User Name: {}", self.user_name)?;
        writeln!(s, "Locale: {} ({})", self.locale.id, self.locale.display_name())?;
        writeln!(s)?;

        writeln!(s, "[OPERATIONAL INSTRUCTIONS]")?;
        writeln!(
            s,
            "1. Use the Local Time above for any queries regarding 'now', 'today', or 'current time'."
        )?;
        writeln!(
            s,
            "2. If asked about the system, refer to the OS Platform and User Name provided above."
        )?;
        writeln!(
            s,
            "3. Do not guess the date. Trust this context over your training data."
        )
    }
}

/// A POSIX locale reduced to a BCP 47 style identifier (`en-US`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    pub id: String,
}

impl Locale {
    fn from_env() -> Self {
        let raw = first_env(&["LC_ALL", "LC_MESSAGES", "LANG"]).unwrap_or_default();
        Self::parse(&raw)
    }

    /// `en_US.UTF-8@euro` -> `en-US`; `C`, `POSIX` and empty -> `C`.
    pub fn parse(raw: &str) -> Self {
        let base = raw
            .split(|c| c == '.' || c == '@')
            .next()
            .unwrap_or_default()
            .trim();
        let id = match base {
            "" | "C" | "POSIX" => "C".to_string(),
            other => other.replace('_', "-"),
        };
        Self { id }
    }

    pub fn display_name(&self) -> String {
        let mut parts = self.id.splitn(2, '-');
        let lang = parts.next().unwrap_or_default();
        let region = parts.next();

        let name = match lang {
            "C" => return "Invariant".to_string(),
            "en" => "English",
            "de" => "German",
            "fr" => "French",
            "es" => "Spanish",
            "it" => "Italian",
            "pt" => "Portuguese",
            "nl" => "Dutch",
            "sv" => "Swedish",
            "pl" => "Polish",
            "ru" => "Russian",
            "uk" => "Ukrainian",
            "tr" => "Turkish",
            "ja" => "Japanese",
            "ko" => "Korean",
            "zh" => "Chinese",
            "hi" => "Hindi",
            "ar" => "Arabic",
            other => other,
        };

        match region {
            Some(r) => format!("{name} ({r})"),
            None => name.to_string(),
        }
    }
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn os_family() -> &'static str {
    match env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        other => other,
    }
}

fn os_version() -> String {
    let pretty = std::fs::read_to_string("/etc/os-release").ok().and_then(|s| {
        s.lines()
            .find_map(|l| l.strip_prefix("PRETTY_NAME="))
            .map(|v| v.trim_matches('"').to_string())
    });
    let kernel = read_trimmed("/proc/sys/kernel/osrelease");

    match (pretty, kernel) {
        (Some(p), Some(k)) => format!("{p} (kernel {k})"),
        (Some(p), None) => p,
        (None, Some(k)) => format!("{} {k}", os_family()),
        (None, None) => format!("{} ({})", os_family(), env::consts::ARCH),
    }
}

fn machine_name() -> String {
    first_env(&["HOSTNAME", "COMPUTERNAME"])
        .or_else(|| read_trimmed("/etc/hostname"))
        .or_else(|| read_trimmed("/proc/sys/kernel/hostname"))
        .unwrap_or_else(|| "unknown".to_string())
}

fn timezone_name() -> String {
    if let Some(tz) = first_env(&["TZ"]) {
        return tz.trim_start_matches(':').to_string();
    }
    if let Some(tz) = read_trimmed("/etc/timezone") {
        return tz;
    }
    std::fs::read_link("/etc/localtime")
        .ok()
        .and_then(|p| {
            let p = p.to_string_lossy().into_owned();
            p.split_once("zoneinfo/").map(|(_, name)| name.to_string())
        })
        .unwrap_or_else(|| "Local".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> SystemContext {
        let utc = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap();
        SystemContext {
            local: utc.with_timezone(&Local),
            utc,
            timezone: "Europe/Berlin".to_string(),
            os_family: "Linux".to_string(),
            os_version: "Debian GNU/Linux 12 (bookworm)".to_string(),
            machine_name: "devbox".to_string(),
            user_name: "sam".to_string(),
            locale: Locale::parse("de_DE.UTF-8"),
        }
    }

    #[test]
    fn render_contains_every_section() {
        let text = fixed().render();
        assert!(text.starts_with("### SYSTEM ENVIRONMENT CONTEXT ###\n"));
        assert!(text.contains("[TEMPORAL DATA]"));
        assert!(text.contains("UTC Time: 2026-10-18 09:30:00 Z"));
        assert!(text.contains("Day of Week: "));
        assert!(text.contains("Timezone: Europe/Berlin (Offset: "));
        assert!(text.contains("OS Platform: Linux"));
        assert!(text.contains("OS Version: Debian GNU/Linux 12 (bookworm)"));
        assert!(text.contains("Machine Name: devbox"));
        assert!(text.contains("User Name: sam"));
        assert!(text.contains("Locale: de-DE (German (DE))"));
        assert!(text.contains("[OPERATIONAL INSTRUCTIONS]"));
        assert!(text.contains("Trust this context over your training data."));
    }

    #[test]
    fn local_time_matches_the_utc_instant() {
        let ctx = fixed();
        let text = ctx.render();
        let local = ctx.local.format("%Y-%m-%d %H:%M:%S").to_string();
        assert!(text.contains(&format!("Local Time: {local}")));
        assert_eq!(ctx.local.with_timezone(&Utc), ctx.utc);
    }

    #[test]
    fn parses_posix_locales() {
        assert_eq!(Locale::parse("en_US.UTF-8").id, "en-US");
        assert_eq!(Locale::parse("fr_FR@euro").id, "fr-FR");
        assert_eq!(Locale::parse("ja").id, "ja");
        assert_eq!(Locale::parse("C.UTF-8").id, "C");
        assert_eq!(Locale::parse("").id, "C");
        assert_eq!(Locale::parse("POSIX").display_name(), "Invariant");
        assert_eq!(Locale::parse("en_GB.UTF-8").display_name(), "English (GB)");
        assert_eq!(Locale::parse("xx_YY").display_name(), "xx (YY)");
    }

    #[test]
    fn capture_is_fresh_each_time() {
        let a = SystemContext::capture();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = SystemContext::capture();
        assert!(b.utc > a.utc);
        assert!(!EnvironmentContext.system_instruction().is_empty());
    }
}
