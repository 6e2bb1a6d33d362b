use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Storage format of every reading timestamp (UTC).
pub const DB_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DB_TIMESTAMP_FORMAT_NO_SECONDS: &str = "%Y-%m-%d %H:%M";
const DISPLAY_TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

// Date formats understood by the browser-side time axis adapter.
pub const AXIS_PARSER_FORMAT: &str = "yyyy-MM-dd HH:mm:ss";
pub const TOOLTIP_FORMAT: &str = "dd-MM-yyyy HH:mm:ss";
pub const AXIS_LABEL_FORMAT: &str = "dd-MM-yyyy HH:mm";

pub const PALETTE: [&str; 10] = [
    "rgb(54, 162, 235)",
    "rgb(255, 99, 132)",
    "rgb(75, 192, 192)",
    "rgb(255, 159, 64)",
    "rgb(153, 102, 255)",
    "rgb(255, 205, 86)",
    "rgb(201, 203, 207)",
    "rgb(0, 128, 96)",
    "rgb(220, 20, 60)",
    "rgb(106, 90, 205)",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChartError {
    #[error("chart data missing")]
    MissingData,
    #[error("invalid chart data: {0}")]
    InvalidData(String),
}

/// One sensor's history as served to the chart page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSeries {
    pub timestamps: Vec<String>,
    pub temperatures: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub x: String,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub label: String,
    pub data: Vec<ChartPoint>,
    pub border_color: &'static str,
    pub background_color: &'static str,
    pub fill: bool,
    pub tension: f32,
    pub point_radius: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartData {
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeFormats {
    pub parser: &'static str,
    pub tooltip_format: &'static str,
    pub display_formats: DisplayFormats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayFormats {
    pub minute: &'static str,
    pub hour: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisTitle {
    pub display: bool,
    pub text: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeAxis {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub time: TimeFormats,
    pub title: AxisTitle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueAxis {
    pub title: AxisTitle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scales {
    pub x: TimeAxis,
    pub y: ValueAxis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartOptions {
    pub responsive: bool,
    pub maintain_aspect_ratio: bool,
    pub scales: Scales,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            responsive: true,
            maintain_aspect_ratio: false,
            scales: Scales {
                x: TimeAxis {
                    kind: "time",
                    time: TimeFormats {
                        parser: AXIS_PARSER_FORMAT,
                        tooltip_format: TOOLTIP_FORMAT,
                        display_formats: DisplayFormats {
                            minute: AXIS_LABEL_FORMAT,
                            hour: AXIS_LABEL_FORMAT,
                        },
                    },
                    title: AxisTitle {
                        display: true,
                        text: "Time",
                    },
                },
                y: ValueAxis {
                    title: AxisTitle {
                        display: true,
                        text: "Temperature (°C)",
                    },
                },
            },
        }
    }
}

/// Line-chart configuration consumed as-is by the page script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartConfig {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: ChartData,
    pub options: ChartOptions,
}

pub fn palette_color(index: usize) -> &'static str {
    PALETTE[index % PALETTE.len()]
}

/// Builds one dataset per sensor key, in the order the keys appear in `source`.
pub fn render_chart(source: Option<&Value>) -> Result<ChartConfig, ChartError> {
    let source = match source {
        None | Some(Value::Null) => return Err(ChartError::MissingData),
        Some(value) => value,
    };
    let sensors = source
        .as_object()
        .ok_or_else(|| ChartError::InvalidData("expected an object keyed by sensor".to_string()))?;

    let mut datasets = Vec::with_capacity(sensors.len());
    for (index, (label, raw)) in sensors.iter().enumerate() {
        let series: SensorSeries = serde_json::from_value(raw.clone())
            .map_err(|err| ChartError::InvalidData(format!("{label}: {err}")))?;
        let color = palette_color(index);

        datasets.push(Dataset {
            label: label.clone(),
            data: series_points(&series),
            border_color: color,
            background_color: color,
            fill: false,
            tension: 0.1,
            point_radius: 2,
        });
    }

    Ok(ChartConfig {
        kind: "line",
        data: ChartData { datasets },
        options: ChartOptions::default(),
    })
}

fn series_points(series: &SensorSeries) -> Vec<ChartPoint> {
    series
        .timestamps
        .iter()
        .zip(&series.temperatures)
        .filter_map(|(timestamp, temperature)| {
            let y = (*temperature)?;
            NaiveDateTime::parse_from_str(timestamp, DB_TIMESTAMP_FORMAT).ok()?;
            Some(ChartPoint {
                x: timestamp.clone(),
                y,
            })
        })
        .collect()
}

/// `YYYY-MM-DD HH:MM[:SS]` to `dd-mm-YYYY HH:MM:SS`; anything else is returned unchanged.
pub fn format_display_timestamp(timestamp: &str) -> String {
    if timestamp.is_empty() {
        return "N/A".to_string();
    }

    NaiveDateTime::parse_from_str(timestamp, DB_TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(timestamp, DB_TIMESTAMP_FORMAT_NO_SECONDS))
        .map(|parsed| parsed.format(DISPLAY_TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn one_dataset_per_sensor_in_palette_order() {
        let mut sensors = serde_json::Map::new();
        for i in 0..12 {
            sensors.insert(
                format!("Room {i}"),
                json!({
                    "timestamps": ["2024-05-01 10:00:00"],
                    "temperatures": [i as f64],
                }),
            );
        }
        let source = Value::Object(sensors);

        let chart = render_chart(Some(&source)).unwrap();
        let datasets = &chart.data.datasets;

        assert_eq!(datasets.len(), 12);
        assert_eq!(datasets[0].label, "Room 0");
        assert_eq!(datasets[11].label, "Room 11");
        for (i, dataset) in datasets.iter().enumerate() {
            assert_eq!(dataset.border_color, PALETTE[i % 10]);
        }
        assert_eq!(datasets[10].border_color, datasets[0].border_color);
    }

    #[test]
    fn keeps_insertion_order_not_alphabetical() {
        let source = json!({
            "Zeta": {"timestamps": [], "temperatures": []},
            "Alpha": {"timestamps": [], "temperatures": []},
        });

        let chart = render_chart(Some(&source)).unwrap();
        let labels: Vec<&str> = chart.data.datasets.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["Zeta", "Alpha"]);
    }

    #[test]
    fn drops_unparseable_and_unpaired_points() {
        let source = json!({
            "Freezer (Sensor: 28FF0011AABBCC01)": {
                "timestamps": ["2024-05-01 10:00:00", "yesterday", "2024-05-01 10:05:00", "2024-05-01 10:10:00"],
                "temperatures": [-18.2, -18.0, null],
            }
        });

        let chart = render_chart(Some(&source)).unwrap();
        assert_eq!(
            chart.data.datasets[0].data,
            vec![ChartPoint {
                x: "2024-05-01 10:00:00".to_string(),
                y: -18.2,
            }]
        );
    }

    #[test]
    fn missing_or_malformed_source_is_an_error() {
        assert_eq!(render_chart(None), Err(ChartError::MissingData));
        assert_eq!(render_chart(Some(&Value::Null)), Err(ChartError::MissingData));
        assert!(matches!(
            render_chart(Some(&json!([1, 2]))),
            Err(ChartError::InvalidData(_))
        ));
        assert!(matches!(
            render_chart(Some(&json!({"S1": {"timestamps": "nope"}}))),
            Err(ChartError::InvalidData(_))
        ));
    }

    #[test]
    fn serialized_config_uses_time_axis_formats() {
        let chart = render_chart(Some(&json!({}))).unwrap();
        let value = serde_json::to_value(&chart).unwrap();

        assert_eq!(value["type"], "line");
        assert_eq!(value["options"]["scales"]["x"]["type"], "time");
        assert_eq!(value["options"]["scales"]["x"]["time"]["parser"], AXIS_PARSER_FORMAT);
        assert_eq!(value["options"]["scales"]["x"]["time"]["tooltipFormat"], TOOLTIP_FORMAT);
        assert_eq!(
            value["options"]["scales"]["x"]["time"]["displayFormats"]["hour"],
            AXIS_LABEL_FORMAT
        );
    }

    #[test]
    fn display_timestamp_formatting() {
        assert_eq!(format_display_timestamp("2024-05-01 09:07:03"), "01-05-2024 09:07:03");
        assert_eq!(format_display_timestamp("2024-05-01 09:07"), "01-05-2024 09:07:00");
        assert_eq!(format_display_timestamp("not a date"), "not a date");
        assert_eq!(format_display_timestamp(""), "N/A");
    }
}
