//! Job definition templates, one per scheduling mechanism.
//!
//! Every template runs the same command line (`<ipcertctl> --renew --jitter
//! 300`) every four hours. The jitter is applied by ipcertctl itself, so none
//! of these need shell arithmetic or a randomized timer delay.

use super::{JOB_NAME, RENEW_INTERVAL_SECS};

/// Comment tagging ipcert lines in a crontab
pub const CRON_MARKER: &str = "# ipcert-renew";

/// launchd job label
pub const LAUNCHD_LABEL: &str = "com.ipcert.renew";

/// rc.d script names may not contain dashes
pub const BSD_RC_NAME: &str = "ipcert_renew";

pub fn systemd_service(command: &str) -> String {
    format!(
        "[Unit]
Description=ipcert certificate renewal
Wants=network-online.target
After=network-online.target

[Service]
Type=oneshot
ExecStart={command}
",
        command = command
    )
}

pub fn systemd_timer() -> String {
    format!(
        "[Unit]
Description=Run {name} every 4 hours

[Timer]
OnCalendar=*-*-* 00/4:00:00
OnBootSec=5min
Persistent=true
Unit={name}.service

[Install]
WantedBy=timers.target
",
        name = JOB_NAME
    )
}

/// Shell loop shared by the long-running init scripts
fn renew_loop(command: &str) -> String {
    format!(
        "while true; do {command} >/dev/null 2>&1; sleep {interval}; done",
        command = command,
        interval = RENEW_INTERVAL_SECS
    )
}

pub fn openrc_script(command: &str) -> String {
    format!(
        "#!/sbin/openrc-run

description=\"ipcert certificate renewal loop\"
command=\"/bin/sh\"
command_args=\"-c '{body}'\"
command_background=true
pidfile=\"/run/{name}.pid\"

depend() {{
    need net
    after firewall
}}
",
        body = renew_loop(command),
        name = JOB_NAME
    )
}

pub fn sysv_script(command: &str) -> String {
    format!(
        "#!/bin/sh
### BEGIN INIT INFO
# Provides:          {name}
# Required-Start:    $network $remote_fs
# Required-Stop:     $network $remote_fs
# Default-Start:     2 3 4 5
# Default-Stop:      0 1 6
# Short-Description: ipcert certificate renewal loop
### END INIT INFO

PIDFILE=/var/run/{name}.pid

start() {{
    if [ -f \"$PIDFILE\" ] && kill -0 \"$(cat \"$PIDFILE\")\" 2>/dev/null; then
        return 0
    fi
    nohup /bin/sh -c '{body}' >/dev/null 2>&1 &
    echo $! > \"$PIDFILE\"
}}

stop() {{
    if [ -f \"$PIDFILE\" ]; then
        kill \"$(cat \"$PIDFILE\")\" 2>/dev/null
        rm -f \"$PIDFILE\"
    fi
}}

case \"$1\" in
    start) start ;;
    stop) stop ;;
    restart) stop; start ;;
    status)
        [ -f \"$PIDFILE\" ] && kill -0 \"$(cat \"$PIDFILE\")\" 2>/dev/null
        ;;
    *) echo \"Usage: $0 {{start|stop|restart|status}}\"; exit 2 ;;
esac
",
        body = renew_loop(command),
        name = JOB_NAME
    )
}

pub fn bsd_rc_script(command: &str) -> String {
    format!(
        "#!/bin/sh
#
# PROVIDE: {rc}
# REQUIRE: NETWORKING
# KEYWORD: shutdown

. /etc/rc.subr

name=\"{rc}\"
rcvar=\"{rc}_enable\"
pidfile=\"/var/run/{rc}.pid\"
command=\"/usr/sbin/daemon\"
command_args=\"-f -p ${{pidfile}} /bin/sh -c '{body}'\"

load_rc_config $name
: ${{{rc}_enable:=\"NO\"}}

run_rc_command \"$1\"
",
        rc = BSD_RC_NAME,
        body = renew_loop(command)
    )
}

/// launchd wants program arguments split, not a shell line
pub fn launchd_plist(program: &str, args: &[&str]) -> String {
    let mut arguments = format!("        <string>{}</string>\n", xml_escape(program));
    for arg in args {
        arguments.push_str(&format!("        <string>{}</string>\n", xml_escape(arg)));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>
<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">
<plist version=\"1.0\">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>StartInterval</key>
    <integer>{interval}</integer>
    <key>RunAtLoad</key>
    <true/>
    <key>StandardErrorPath</key>
    <string>/var/log/ipcert/launchd.err</string>
</dict>
</plist>
",
        label = LAUNCHD_LABEL,
        arguments = arguments,
        interval = RENEW_INTERVAL_SECS
    )
}

/// `/etc/cron.d` entry (has a user column)
pub fn cron_d_entry(command: &str) -> String {
    format!(
        "SHELL=/bin/sh\nPATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n{}\n",
        cron_line(command, Some("root"))
    )
}

/// One crontab line. Minute 30 keeps it apart from the primary timer.
pub fn cron_line(command: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!(
            "30 */4 * * * {} {} >/dev/null 2>&1 {}",
            user, command, CRON_MARKER
        ),
        None => format!("30 */4 * * * {} >/dev/null 2>&1 {}", command, CRON_MARKER),
    }
}

/// Replace ipcert's line in an existing crontab, keeping everything else
pub fn merge_crontab(existing: &str, command: &str) -> String {
    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|line| !line.contains(CRON_MARKER))
        .collect();
    let ours = cron_line(command, None);
    lines.push(&ours);
    let mut merged = lines.join("\n");
    merged.push('\n');
    merged
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CMD: &str = "/usr/local/bin/ipcertctl --renew --jitter 300";

    #[test]
    fn test_systemd_pair() {
        assert!(systemd_service(CMD).contains(&format!("ExecStart={}", CMD)));
        let timer = systemd_timer();
        assert!(timer.contains("OnCalendar=*-*-* 00/4:00:00"));
        assert!(timer.contains("Persistent=true"));
        assert!(timer.contains("Unit=ipcert-renew.service"));
    }

    #[test]
    fn test_init_scripts_loop_every_four_hours() {
        for script in [openrc_script(CMD), sysv_script(CMD), bsd_rc_script(CMD)] {
            assert!(script.contains("sleep 14400"));
            assert!(script.contains(CMD));
        }
        assert!(bsd_rc_script(CMD).contains(": ${ipcert_renew_enable:=\"NO\"}"));
    }

    #[test]
    fn test_launchd_plist() {
        let plist = launchd_plist("/usr/local/bin/ipcertctl", &["--renew", "--jitter", "300"]);
        assert!(plist.contains("<string>com.ipcert.renew</string>"));
        assert!(plist.contains("<integer>14400</integer>"));
        assert!(plist.contains("<string>--jitter</string>"));
    }

    #[test]
    fn test_merge_crontab_replaces_our_line() {
        let existing = format!(
            "MAILTO=ops@example.com\n0 3 * * * /usr/bin/backup\n{}\n",
            cron_line("/old/ipcertctl --renew", None)
        );
        let merged = merge_crontab(&existing, CMD);
        assert_eq!(merged.matches(CRON_MARKER).count(), 1);
        assert!(merged.contains("/usr/bin/backup"));
        assert!(!merged.contains("/old/ipcertctl"));

        // Idempotent
        assert_eq!(merge_crontab(&merged, CMD), merged);
    }

    #[test]
    fn test_cron_d_entry_has_user_column() {
        assert!(cron_d_entry(CMD).contains("30 */4 * * * root /usr/local/bin/ipcertctl"));
    }
}
