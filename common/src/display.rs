use crate::{
    error_log::ErrorEntry,
    types::{format_uptime, MonitorStatus},
};

pub const DISPLAY_COLS: usize = 16;
pub const DISPLAY_ROWS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayPage {
    #[default]
    Overview,
    Readings,
    System,
}

impl DisplayPage {
    pub fn next(self) -> Self {
        match self {
            Self::Overview => Self::Readings,
            Self::Readings => Self::System,
            Self::System => Self::Overview,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Overview => "COLD ROOM MON",
            Self::Readings => "READINGS",
            Self::System => "SYSTEM",
        }
    }
}

/// Lays out one status page as at most `DISPLAY_ROWS` lines of `DISPLAY_COLS` characters.
pub fn render_page(
    page: DisplayPage,
    status: &MonitorStatus,
    last_error: Option<&ErrorEntry>,
) -> Vec<String> {
    let mut lines = vec![page.title().to_string()];

    match page {
        DisplayPage::Overview => {
            let connected = status.probes.iter().filter(|probe| probe.connected).count();
            lines.push(format!(
                "WiFi: {}",
                if status.wifi_connected { "OK" } else { "DOWN" }
            ));
            lines.push(format!("Sensors: {}/{}", connected, status.probes.len()));
            lines.push(format!(
                "Batch: {}/{}",
                status.readings_collected, status.batch_size
            ));
            lines.push(if status.send_in_flight {
                "Sending...".to_string()
            } else if status.next_send_in_ms == 0 {
                "Send: ready".to_string()
            } else {
                format!("Send in {}", format_countdown(status.next_send_in_ms))
            });
            lines.push(format!("Sent: {}", status.successful_sends));
        }
        DisplayPage::Readings => {
            if status.probes.is_empty() {
                lines.push("No sensors".to_string());
            }

            let visible = DISPLAY_ROWS - 1;
            let overflow = status.probes.len() > visible;
            let shown = if overflow { visible - 1 } else { visible };

            for probe in status.probes.iter().take(shown) {
                let value = match (probe.connected, probe.last_temp_c) {
                    (false, _) => "ERR".to_string(),
                    (true, Some(temp)) => format!("{temp:.1}C"),
                    (true, None) => "--".to_string(),
                };
                let name: String = probe.name.chars().take(9).collect();
                lines.push(format!("{name:<9}{value:>7}"));
            }

            if overflow {
                lines.push(format!("+{} more", status.probes.len() - shown));
            }
        }
        DisplayPage::System => {
            lines.push(format!("Up {}", format_uptime(status.uptime_ms)));
            lines.push(format!("Boots: {}", status.boot_count));
            lines.push(format!("Errors: {}", status.error_count));
            match last_error {
                Some(entry) => {
                    lines.push("Last error:".to_string());
                    lines.push(entry.kind.as_str().to_string());
                    lines.push(entry.message.clone());
                }
                None => lines.push("No errors".to_string()),
            }
        }
    }

    lines
        .into_iter()
        .take(DISPLAY_ROWS)
        .map(|line| line.chars().take(DISPLAY_COLS).collect())
        .collect()
}

fn format_countdown(ms: u64) -> String {
    let secs = ms.div_ceil(1_000);
    format!("{}m{:02}s", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorKind, ProbeStatus};
    use pretty_assertions::assert_eq;

    fn status_with_probes(count: usize) -> MonitorStatus {
        MonitorStatus {
            device_mac: "AA:BB:CC:DD:EE:FF".to_string(),
            wifi_connected: true,
            readings_collected: 2,
            batch_size: 5,
            next_send_in_ms: 252_000,
            send_in_flight: false,
            successful_sends: 3,
            uptime_ms: 3_723_000,
            boot_count: 1,
            error_count: 0,
            last_error: None,
            probes: (0..count)
                .map(|i| ProbeStatus {
                    address: format!("28{i:014X}"),
                    name: format!("S{}", i + 1),
                    connected: i != 1,
                    last_temp_c: if i == 2 { None } else { Some(-2.3 + i as f32) },
                    consecutive_errors: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn pages_rotate_in_order() {
        let page = DisplayPage::default();
        assert_eq!(page, DisplayPage::Overview);
        assert_eq!(page.next(), DisplayPage::Readings);
        assert_eq!(page.next().next(), DisplayPage::System);
        assert_eq!(page.next().next().next(), DisplayPage::Overview);
    }

    #[test]
    fn overview_page_layout() {
        let lines = render_page(DisplayPage::Overview, &status_with_probes(3), None);
        assert_eq!(
            lines,
            vec![
                "COLD ROOM MON",
                "WiFi: OK",
                "Sensors: 2/3",
                "Batch: 2/5",
                "Send in 4m12s",
                "Sent: 3",
            ]
        );
    }

    #[test]
    fn readings_page_marks_disconnected_and_overflow() {
        let lines = render_page(DisplayPage::Readings, &status_with_probes(10), None);

        assert_eq!(lines.len(), DISPLAY_ROWS);
        assert_eq!(lines[1], "S1         -2.3C");
        assert_eq!(lines[2], "S2           ERR");
        assert_eq!(lines[3], "S3            --");
        assert_eq!(lines[7], "+4 more");
        assert!(lines.iter().all(|line| line.chars().count() <= DISPLAY_COLS));
    }

    #[test]
    fn system_page_shows_truncated_last_error() {
        let entry = ErrorEntry {
            uptime_ms: 1_000,
            kind: ErrorKind::HttpError,
            message: "server answered HTTP 500".to_string(),
        };
        let lines = render_page(DisplayPage::System, &status_with_probes(1), Some(&entry));

        assert_eq!(lines[1], "Up 01:02:03");
        assert_eq!(lines[5], "HTTP_ERROR");
        assert_eq!(lines[6], "server answered ");
    }
}
