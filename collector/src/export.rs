use chrono::NaiveDate;

use crate::{
    stats::{aggregate, filter_by_date, round_to, Aggregation},
    store::{ColdRoom, TemperatureRecord},
};

const FULL_HEADER: [&str; 2] = ["Timestamp", "Temperature (°C)"];
const AGGREGATE_HEADER: [&str; 5] = [
    "Timestamp",
    "Average Temperature (°C)",
    "Min Temperature (°C)",
    "Max Temperature (°C)",
    "Number of Readings",
];

#[derive(Debug, Clone, PartialEq)]
pub struct CsvExport {
    pub filename: String,
    pub body: Vec<u8>,
}

/// Builds the CSV for one room. Rows are newest first.
pub fn export_csv(
    room: &ColdRoom,
    records_newest_first: &[&TemperatureRecord],
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    aggregation: Aggregation,
) -> Result<CsvExport, csv::Error> {
    let records = filter_by_date(records_newest_first, date_from, date_to);
    let mut wtr = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());

    match aggregation {
        Aggregation::Full => {
            wtr.write_record(FULL_HEADER)?;
            for record in &records {
                wtr.write_record([record.timestamp.clone(), record.temperature.to_string()])?;
            }
        }
        Aggregation::Hourly | Aggregation::Daily => {
            wtr.write_record(AGGREGATE_HEADER)?;
            for row in aggregate(&records, aggregation) {
                wtr.write_record([
                    row.timestamp,
                    round_to(row.avg_temp, 2).to_string(),
                    round_to(row.min_temp, 2).to_string(),
                    round_to(row.max_temp, 2).to_string(),
                    row.readings.to_string(),
                ])?;
            }
        }
    }

    let body = wtr.into_inner().map_err(|err| csv::Error::from(err.into_error()))?;
    Ok(CsvExport {
        filename: export_filename(&room.name, aggregation, date_from, date_to),
        body,
    })
}

pub fn export_filename(
    room_name: &str,
    aggregation: Aggregation,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
) -> String {
    let date_part = |date: Option<NaiveDate>| {
        date.map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "all".to_string())
    };
    let name: String = room_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect();

    format!(
        "{name}_{}_{}_{}.csv",
        aggregation.as_str(),
        date_part(date_from),
        date_part(date_to)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn room() -> ColdRoom {
        ColdRoom {
            id: 3,
            name: "Freezer 2".to_string(),
            location: "Dock".to_string(),
            sensor_id: Some("28FF".to_string()),
        }
    }

    fn record(timestamp: &str, temperature: f64) -> TemperatureRecord {
        TemperatureRecord {
            room_id: 3,
            temperature,
            timestamp: timestamp.to_string(),
        }
    }

    #[test]
    fn full_export_lists_filtered_rows() {
        let records = [
            record("2024-05-03 08:00:00", -17.5),
            record("2024-05-02 08:00:00", -18.25),
            record("2024-05-01 08:00:00", -18.0),
        ];
        let refs: Vec<&TemperatureRecord> = records.iter().collect();

        let export = export_csv(
            &room(),
            &refs,
            NaiveDate::from_ymd_opt(2024, 5, 2),
            None,
            Aggregation::Full,
        )
        .unwrap();

        assert_eq!(export.filename, "Freezer_2_full_2024-05-02_all.csv");
        assert_eq!(
            String::from_utf8(export.body).unwrap(),
            "Timestamp,Temperature (°C)\r\n2024-05-03 08:00:00,-17.5\r\n2024-05-02 08:00:00,-18.25\r\n"
        );
    }

    #[test]
    fn daily_export_rounds_to_two_decimals() {
        let records = [
            record("2024-05-02 09:00:00", 1.0),
            record("2024-05-02 08:00:00", 2.0),
            record("2024-05-02 07:00:00", 2.0),
            record("2024-05-01 07:00:00", 4.0),
        ];
        let refs: Vec<&TemperatureRecord> = records.iter().collect();

        let export = export_csv(&room(), &refs, None, None, Aggregation::Daily).unwrap();

        let body = String::from_utf8(export.body).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Timestamp,Average Temperature (°C),Min Temperature (°C),Max Temperature (°C),Number of Readings",
                "2024-05-02,1.67,1,2,3",
                "2024-05-01,4,4,4,1",
            ]
        );
        assert_eq!(export.filename, "Freezer_2_daily_all_all.csv");
    }

    #[test]
    fn empty_range_still_has_a_header() {
        let records = [record("2024-05-01 08:00:00", -18.0)];
        let refs: Vec<&TemperatureRecord> = records.iter().collect();

        let export = export_csv(
            &room(),
            &refs,
            NaiveDate::from_ymd_opt(2024, 6, 1),
            NaiveDate::from_ymd_opt(2024, 6, 30),
            Aggregation::Hourly,
        )
        .unwrap();

        assert_eq!(
            String::from_utf8(export.body).unwrap(),
            "Timestamp,Average Temperature (°C),Min Temperature (°C),Max Temperature (°C),Number of Readings\r\n"
        );
        assert_eq!(export.filename, "Freezer_2_hourly_2024-06-01_2024-06-30.csv");
    }
}
