use std::time::Duration;

use meter_client::domain::{FuelKind, MeterPoint, Reading, Watermark};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};

use crate::{
    config::OctopusConfig,
    pipeline::{ReadingSource, ReadingStream, SyncError},
};

/// One page of `GET .../consumption/`.
#[derive(Debug, Deserialize)]
struct ConsumptionPage {
    #[serde(default)]
    results: Option<Vec<RawConsumption>>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConsumption {
    consumption: f64,
    interval_start: String,
}

fn parse_record(fuel: FuelKind, raw: RawConsumption) -> Result<Reading, SyncError> {
    let period_start = OffsetDateTime::parse(raw.interval_start.trim(), &Rfc3339).map_err(|e| {
        tracing::error!(error = %e, "Error parsing time: {}", raw.interval_start);
        SyncError::Format {
            fuel,
            message: format!("invalid interval_start '{}': {e}", raw.interval_start),
        }
    })?;

    Ok(Reading {
        fuel,
        consumption: raw.consumption,
        period_start,
    })
}

fn fetch_error(fuel: FuelKind, e: reqwest::Error) -> SyncError {
    SyncError::Fetch {
        fuel,
        message: e.to_string(),
    }
}

/// Consumption source backed by the Octopus Energy REST API.
#[derive(Clone)]
pub struct OctopusSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    page_size: u32,
}

impl OctopusSource {
    pub fn new(cfg: &OctopusConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(concat!("consumption-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            page_size: cfg.page_size,
        })
    }

    pub fn consumption_url(&self, meter: &MeterPoint) -> String {
        format!(
            "{}/{}-meter-points/{}/meters/{}/consumption/",
            self.base_url, meter.fuel, meter.mpn, meter.serial
        )
    }

    fn first_page_query(
        &self,
        fuel: FuelKind,
        watermark: &Watermark,
    ) -> Result<Vec<(&'static str, String)>, SyncError> {
        let mut query = vec![
            ("order_by", "period".to_string()),
            ("page_size", self.page_size.to_string()),
        ];

        if let Some(from) = watermark.fetch_from() {
            let from = from.to_offset(UtcOffset::UTC).format(&Rfc3339).map_err(|e| SyncError::Format {
                fuel,
                message: format!("cannot format period_from: {e}"),
            })?;
            query.push(("period_from", from));
        }

        Ok(query)
    }

    async fn get_page(
        &self,
        fuel: FuelKind,
        url: &str,
        query: &[(&'static str, String)],
    ) -> Result<ConsumptionPage, SyncError> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.api_key, Some(""))
            .query(query)
            .send()
            .await
            .map_err(|e| fetch_error(fuel, e))?
            .error_for_status()
            .map_err(|e| fetch_error(fuel, e))?;

        response.json().await.map_err(|e| fetch_error(fuel, e))
    }
}

#[async_trait::async_trait]
impl ReadingSource for OctopusSource {
    async fn fetch(&self, meter: &MeterPoint, watermark: Watermark) -> ReadingStream {
        let this = self.clone();
        let fuel = meter.fuel;
        let first_url = self.consumption_url(meter);

        let s = async_stream::try_stream! {
            // `next` links already carry the query of the first request.
            let mut query = this.first_page_query(fuel, &watermark)?;
            let mut next = Some(first_url);
            let mut pages: u32 = 0;

            while let Some(url) = next.take() {
                let page = this.get_page(fuel, &url, &query).await?;
                query.clear();
                pages += 1;

                let results = page.results.unwrap_or_default();
                tracing::debug!(fuel_type = %fuel, page = pages, records = results.len(), "got consumption page");

                for raw in results {
                    let reading = parse_record(fuel, raw)?;
                    if !watermark.admits(reading.period_start) {
                        tracing::debug!(fuel_type = %fuel, period = %reading.period_start, "skipping already stored reading");
                        continue;
                    }
                    yield reading;
                }

                next = page.next;
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode},
        routing::get,
        Json, Router,
    };
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };
    use time::macros::datetime;

    #[derive(Clone, Default)]
    struct FakeApi {
        base: Arc<Mutex<String>>,
        requests: Arc<Mutex<Vec<(String, HashMap<String, String>, Option<String>)>>>,
    }

    async fn consumption(
        State(api): State<FakeApi>,
        Path((fuel_path, mpn, serial)): Path<(String, String, String)>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, StatusCode> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        api.requests
            .lock()
            .unwrap()
            .push((format!("{fuel_path}/{mpn}/{serial}"), params.clone(), auth));

        match (fuel_path.as_str(), params.get("page").map(String::as_str)) {
            ("electricity-meter-points", None) => {
                let base = api.base.lock().unwrap().clone();
                Ok(Json(json!({
                    "count": 3,
                    "next": format!("{base}/electricity-meter-points/{mpn}/meters/{serial}/consumption/?page=2&order_by=period"),
                    "previous": null,
                    "results": [
                        {"consumption": 0.5, "interval_start": "2024-01-01T00:00:00Z", "interval_end": "2024-01-01T00:30:00Z"},
                        {"consumption": 0.25, "interval_start": "2024-01-01T00:30:00Z", "interval_end": "2024-01-01T01:00:00Z"}
                    ]
                })))
            }
            ("electricity-meter-points", Some("2")) => Ok(Json(json!({
                "count": 3,
                "next": null,
                "previous": null,
                "results": [
                    {"consumption": 1.0, "interval_start": "2024-01-01T02:00:00+01:00", "interval_end": "2024-01-01T02:30:00+01:00"}
                ]
            }))),
            ("gas-meter-points", _) if mpn == "empty" => Ok(Json(json!({
                "count": 0,
                "next": null,
                "previous": null,
                "results": []
            }))),
            ("gas-meter-points", _) if mpn == "null" => Ok(Json(json!({"count": 0, "next": null}))),
            ("gas-meter-points", _) if mpn == "broken" => Ok(Json(json!({
                "count": 2,
                "next": null,
                "results": [
                    {"consumption": 3.0, "interval_start": "2024-01-01T00:00:00Z"},
                    {"consumption": 4.0, "interval_start": "yesterday"}
                ]
            }))),
            _ => Err(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    async fn serve() -> (FakeApi, OctopusSource) {
        let api = FakeApi::default();
        let app = Router::new()
            .route("/v1/:fuel_path/:mpn/meters/:serial/consumption/", get(consumption))
            .with_state(api.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        *api.base.lock().unwrap() = base.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let source = OctopusSource::new(&OctopusConfig {
            base_url: base,
            api_key: "sk_test".to_string(),
            request_timeout_secs: 5,
            page_size: 2,
        })
        .unwrap();

        (api, source)
    }

    fn meter(fuel: FuelKind, mpn: &str) -> MeterPoint {
        MeterPoint {
            fuel,
            mpn: mpn.to_string(),
            serial: "S1".to_string(),
        }
    }

    async fn collect(source: &OctopusSource, meter: &MeterPoint, wm: Watermark) -> Vec<Result<Reading, SyncError>> {
        source.fetch(meter, wm).await.collect().await
    }

    #[tokio::test]
    async fn follows_next_links_and_yields_readings_in_order() {
        let (api, source) = serve().await;

        let readings: Vec<Reading> = collect(&source, &meter(FuelKind::Electricity, "123"), Watermark::empty())
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        let starts: Vec<_> = readings.iter().map(|r| r.period_start).collect();
        assert_eq!(
            starts,
            vec![
                datetime!(2024-01-01 00:00:00 UTC),
                datetime!(2024-01-01 00:30:00 UTC),
                datetime!(2024-01-01 01:00:00 UTC),
            ]
        );
        assert_eq!(readings[2].consumption, 1.0);
        assert!(readings.iter().all(|r| r.fuel == FuelKind::Electricity));

        let requests = api.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let (path, params, auth) = &requests[0];
        assert_eq!(path, "electricity-meter-points/123/S1");
        assert_eq!(params.get("order_by").map(String::as_str), Some("period"));
        assert_eq!(params.get("page_size").map(String::as_str), Some("2"));
        assert!(!params.contains_key("period_from"));
        // base64("sk_test:")
        assert_eq!(auth.as_deref(), Some("Basic c2tfdGVzdDo="));
        assert_eq!(requests[1].1.get("page").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn sends_period_from_and_drops_the_boundary_reading() {
        let (api, source) = serve().await;
        let wm = Watermark::after(datetime!(2024-01-01 00:00:00 UTC), Duration::from_secs(1));

        let readings: Vec<Reading> = collect(&source, &meter(FuelKind::Electricity, "123"), wm)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.period_start > datetime!(2024-01-01 00:00:00 UTC)));

        let requests = api.requests.lock().unwrap();
        assert_eq!(
            requests[0].1.get("period_from").map(String::as_str),
            Some("2024-01-01T00:00:01Z")
        );
    }

    #[tokio::test]
    async fn empty_or_missing_results_are_an_empty_stream() {
        let (_api, source) = serve().await;

        assert!(collect(&source, &meter(FuelKind::Gas, "empty"), Watermark::empty()).await.is_empty());
        assert!(collect(&source, &meter(FuelKind::Gas, "null"), Watermark::empty()).await.is_empty());
    }

    #[tokio::test]
    async fn unparseable_interval_start_fails_the_stream() {
        let (_api, source) = serve().await;

        let items = collect(&source, &meter(FuelKind::Gas, "broken"), Watermark::empty()).await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(SyncError::Format { fuel: FuelKind::Gas, .. })));
    }

    #[tokio::test]
    async fn http_errors_are_fetch_errors() {
        let (_api, source) = serve().await;

        let items = collect(&source, &meter(FuelKind::Gas, "unknown"), Watermark::empty()).await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(SyncError::Fetch { fuel: FuelKind::Gas, .. })));
    }

    #[tokio::test]
    async fn nothing_is_requested_until_the_stream_is_polled() {
        let (api, source) = serve().await;

        let stream = source.fetch(&meter(FuelKind::Electricity, "123"), Watermark::empty()).await;
        tokio::task::yield_now().await;
        assert!(api.requests.lock().unwrap().is_empty());
        drop(stream);
    }

    #[test]
    fn consumption_url_uses_fuel_specific_meter_point_path() {
        let source = OctopusSource::new(&OctopusConfig {
            base_url: "https://api.octopus.energy/v1/".to_string(),
            ..OctopusConfig::default()
        })
        .unwrap();

        assert_eq!(
            source.consumption_url(&meter(FuelKind::Gas, "987")),
            "https://api.octopus.energy/v1/gas-meter-points/987/meters/S1/consumption/"
        );
    }
}
