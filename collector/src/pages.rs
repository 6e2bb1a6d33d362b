use askama::Template;
use serde_json::Value;

use coldroom_common::{render_chart, ChartError};

use crate::stats::RoomStats;
use crate::store::ColdRoom;

/// Per-room detail page with 24 hour stats, export links and the chart.
#[derive(Template)]
#[template(path = "room.html")]
pub struct RoomPage<'a> {
    room: &'a ColdRoom,
    sensor: &'a str,
    avg: String,
    min: String,
    max: String,
    readings_count: usize,
    trend: &'static str,
    chart_config: Option<String>,
}

impl<'a> RoomPage<'a> {
    pub fn new(room: &'a ColdRoom, stats: &RoomStats, source: Option<&Value>) -> Self {
        Self {
            room,
            sensor: room.sensor_id.as_deref().unwrap_or("No Sensor"),
            avg: format_stat(stats.avg_temp),
            min: format_stat(stats.min_temp),
            max: format_stat(stats.max_temp),
            readings_count: stats.readings_count,
            trend: stats.trend.as_str(),
            chart_config: chart_config(source),
        }
    }
}

/// JSON safe to place inside a `<script>` element.
fn script_json(config: &impl serde::Serialize) -> Option<String> {
    serde_json::to_string(config)
        .ok()
        .map(|json| json.replace("</", "<\\/"))
}

fn chart_config(source: Option<&Value>) -> Option<String> {
    match render_chart(source) {
        Ok(config) => script_json(&config),
        Err(ChartError::MissingData) => {
            tracing::error!("chart data missing, skipping chart");
            None
        }
        Err(err) => {
            tracing::error!("chart data rejected: {err}");
            None
        }
    }
}

fn format_stat(value: Option<f64>) -> String {
    value
        .map(|value| format!("{value:.1} °C"))
        .unwrap_or_else(|| "N/A".to_string())
}

pub fn room_page(room: &ColdRoom, stats: &RoomStats, source: Option<&Value>) -> askama::Result<String> {
    RoomPage::new(room, stats, source).render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Trend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn room() -> ColdRoom {
        ColdRoom {
            id: 7,
            name: "Ice <Cream>".to_string(),
            location: "Bay & 2".to_string(),
            sensor_id: None,
        }
    }

    fn stats() -> RoomStats {
        RoomStats {
            avg_temp: Some(-18.0),
            min_temp: Some(-18.4),
            max_temp: Some(-17.6),
            readings_count: 12,
            trend: Trend::Falling,
        }
    }

    #[test]
    fn page_escapes_room_fields() {
        let page = room_page(&room(), &stats(), None).unwrap();

        assert!(page.contains("<h1>Ice &lt;Cream&gt;</h1>"));
        assert!(page.contains("Bay &amp; 2 &middot; Sensor: No Sensor"));
        assert!(page.contains("/rooms/7/export?format=csv&amp;aggregation=daily"));
    }

    #[test]
    fn page_embeds_chart_config() {
        let source = json!({
            "Ice (No Sensor)": {
                "timestamps": ["2024-05-02 10:00:00"],
                "temperatures": [-18.0],
            }
        });

        let page = room_page(&room(), &stats(), Some(&source)).unwrap();

        assert!(page.contains("id=\"chart-config\""));
        assert!(page.contains("\"type\":\"line\""));
        assert!(page.contains("-18.4 °C"));
        assert!(page.contains("trend-falling"));
    }

    #[test]
    fn missing_data_omits_chart_config() {
        let empty = RoomStats {
            avg_temp: None,
            min_temp: None,
            max_temp: None,
            readings_count: 0,
            trend: Trend::Stable,
        };
        let page = room_page(&room(), &empty, None).unwrap();

        assert!(!page.contains("id=\"chart-config\""));
        assert!(page.contains("temperature-chart"));
        assert!(!page.contains("°C"));
        assert!(page.contains("trend-stable"));
    }

    #[test]
    fn script_json_cannot_close_the_script_element() {
        let json = script_json(&json!({"label": "</script>"})).unwrap();
        assert_eq!(json, r#"{"label":"<\/script>"}"#);
    }
}
