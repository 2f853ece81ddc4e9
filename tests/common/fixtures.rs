//! Source fixtures: CSV bodies and mock endpoints serving them

use dataset_archiver::{FetchTask, PartitionKey};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::DATASET;

/// CSV body of `rows` data rows, distinct per `tag`
pub fn csv_body(tag: &str, rows: usize) -> String {
    let mut body = String::from("plant_id,year,capacity_mw\n");
    for row in 0..rows {
        body.push_str(&format!("{tag}-{row},{row},{}\n", row * 7 % 113));
    }
    body
}

/// Serve `body` at `/data/<year>.csv`
pub async fn serve_year(server: &MockServer, year: i64, body: impl Into<String>) {
    Mock::given(method("GET"))
        .and(path(format!("/data/{year}.csv")))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.into()))
        .mount(server)
        .await;
}

/// Serve `body` at an arbitrary path
pub async fn serve_path(server: &MockServer, at: &str, body: impl Into<String>) {
    Mock::given(method("GET"))
        .and(path(at.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.into()))
        .mount(server)
        .await;
}

/// Serve `body` at `/data/<year>.csv` after a delay
pub async fn serve_year_slowly(server: &MockServer, year: i64, body: &str, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(format!("/data/{year}.csv")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body.to_string())
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

/// Answer `/data/<year>.csv` with `status` for the next `times` requests
///
/// Mount this before a successful response for the same year to model an outage
/// that ends.
pub async fn fail_year(server: &MockServer, year: i64, status: u16, times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/data/{year}.csv")))
        .respond_with(ResponseTemplate::new(status))
        .up_to_n_times(times)
        .mount(server)
        .await;
}

/// Answer `/data/<year>.csv` with `status` forever
pub async fn fail_year_always(server: &MockServer, year: i64, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/data/{year}.csv")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Task staging `/data/<year>.csv` unchanged
pub fn year_task(server: &MockServer, year: i64) -> FetchTask {
    FetchTask::file(
        PartitionKey::single("year", year),
        format!("{}/data/{year}.csv", server.uri()),
        "csv",
    )
}

/// Deposition filename of a year partition
pub fn year_file(year: i64) -> String {
    PartitionKey::single("year", year).filename(DATASET, "csv")
}
