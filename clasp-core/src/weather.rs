//! Weather mapping: the device polls HTTP-shaped paths, the host answers from
//! its latest snapshot. Pure functions, no clock and no network.

use log::debug;
use serde::{Deserialize, Serialize};

pub const CURRENT_PATH: &str = "/weather/v2/current";
pub const DAILY_FORECAST_PATH: &str = "/weather/v2/forecast/day";
pub const HOURLY_FORECAST_PATH: &str = "/weather/v2/forecast/hour";

const DEFAULT_DAILY_DURATION: usize = 5;
const DEFAULT_HOURLY_DURATION: usize = 13;

/// Host-supplied weather state, SI units throughout. Temperatures are Kelvin,
/// wind is m/s, pressure is hPa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    /// Observation time, epoch seconds UTC.
    pub timestamp: u64,
    pub location: String,
    pub kelvin: f32,
    pub feels_like_kelvin: f32,
    pub condition_code: u16,
    pub humidity_percent: u8,
    pub wind_speed_mps: f32,
    pub wind_direction_deg: u16,
    pub pressure_hpa: f32,
    pub uv_index: f32,
    pub chance_of_rain_percent: u8,
    pub dew_point_kelvin: f32,
    pub visibility_m: u32,
    pub sunrise: u64,
    pub sunset: u64,
    pub daily: Vec<DailyForecast>,
    pub hourly: Vec<HourlyForecast>,
}

/// One forecast day, index 0 being tomorrow. Today lives in the snapshot's
/// own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub min_kelvin: f32,
    pub max_kelvin: f32,
    pub condition_code: u16,
    pub chance_of_rain_percent: u8,
    pub sunrise: u64,
    pub sunset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub epoch: u64,
    pub kelvin: f32,
    pub condition_code: u16,
    pub wind_speed_mps: f32,
    pub wind_direction_deg: u16,
    pub humidity_percent: u8,
}

/// What goes back to the watch, in the units its firmware expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WeatherResponse {
    Current(CurrentConditions),
    Daily(Vec<DailyEntry>),
    Hourly(Vec<HourlyEntry>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentConditions {
    pub epoch_seconds: u64,
    pub location: String,
    pub temperature_celsius: f32,
    pub feels_like_celsius: f32,
    pub icon: u8,
    pub humidity_percent: u8,
    pub wind_speed_kph: f32,
    pub wind_direction_deg: u16,
    pub pressure_inhg: f32,
    pub uv_index: f32,
    pub chance_of_rain_percent: u8,
    pub dew_point_celsius: f32,
    pub visibility_km: f32,
    pub sunrise: u64,
    pub sunset: u64,
    pub day_of_week: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyEntry {
    pub day_of_week: u8,
    pub min_celsius: f32,
    pub max_celsius: f32,
    pub icon: u8,
    pub chance_of_rain_percent: u8,
    pub sunrise: u64,
    pub sunset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyEntry {
    pub epoch_seconds: u64,
    pub temperature_celsius: f32,
    pub icon: u8,
    pub wind_speed_kph: f32,
    pub wind_direction_deg: u16,
    pub humidity_percent: u8,
}

/// Answer one device weather poll. `None` means nothing to send: no snapshot
/// yet, or a path this host does not serve.
pub fn map_weather(
    path: &str,
    query: &str,
    snapshot: Option<&WeatherSnapshot>,
) -> Option<WeatherResponse> {
    let snapshot = snapshot?;
    let params = QueryParams::parse(query);
    match path {
        CURRENT_PATH => Some(WeatherResponse::Current(current(snapshot))),
        DAILY_FORECAST_PATH => {
            let count = params
                .duration
                .unwrap_or(DEFAULT_DAILY_DURATION)
                .min(snapshot.daily.len());
            let mut entries = Vec::with_capacity(count);
            for (i, day) in snapshot.daily.iter().take(count).enumerate() {
                entries.push(DailyEntry {
                    day_of_week: day_of_week(snapshot.timestamp + (i as u64 + 1) * 86_400),
                    min_celsius: kelvin_to_celsius(day.min_kelvin),
                    max_celsius: kelvin_to_celsius(day.max_kelvin),
                    icon: condition_to_icon(day.condition_code),
                    chance_of_rain_percent: day.chance_of_rain_percent,
                    sunrise: day.sunrise,
                    sunset: day.sunset,
                });
            }
            Some(WeatherResponse::Daily(entries))
        }
        HOURLY_FORECAST_PATH => {
            let count = params
                .duration
                .unwrap_or(DEFAULT_HOURLY_DURATION)
                .min(snapshot.hourly.len());
            let entries = snapshot
                .hourly
                .iter()
                .take(count)
                .map(|hour| HourlyEntry {
                    epoch_seconds: hour.epoch,
                    temperature_celsius: kelvin_to_celsius(hour.kelvin),
                    icon: condition_to_icon(hour.condition_code),
                    wind_speed_kph: mps_to_kph(hour.wind_speed_mps),
                    wind_direction_deg: hour.wind_direction_deg,
                    humidity_percent: hour.humidity_percent,
                })
                .collect();
            Some(WeatherResponse::Hourly(entries))
        }
        other => {
            debug!("unserved weather path {other:?}");
            None
        }
    }
}

fn current(snapshot: &WeatherSnapshot) -> CurrentConditions {
    CurrentConditions {
        epoch_seconds: snapshot.timestamp,
        location: snapshot.location.clone(),
        temperature_celsius: kelvin_to_celsius(snapshot.kelvin),
        feels_like_celsius: kelvin_to_celsius(snapshot.feels_like_kelvin),
        icon: condition_to_icon(snapshot.condition_code),
        humidity_percent: snapshot.humidity_percent,
        wind_speed_kph: mps_to_kph(snapshot.wind_speed_mps),
        wind_direction_deg: snapshot.wind_direction_deg,
        pressure_inhg: hpa_to_inhg(snapshot.pressure_hpa),
        uv_index: snapshot.uv_index,
        chance_of_rain_percent: snapshot.chance_of_rain_percent,
        dew_point_celsius: kelvin_to_celsius(snapshot.dew_point_kelvin),
        visibility_km: snapshot.visibility_m as f32 / 1000.0,
        sunrise: snapshot.sunrise,
        sunset: snapshot.sunset,
        day_of_week: day_of_week(snapshot.timestamp),
    }
}

struct QueryParams {
    duration: Option<usize>,
}

impl QueryParams {
    fn parse(query: &str) -> Self {
        let mut params = QueryParams { duration: None };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                debug!("weather query pair without value: {pair:?}");
                continue;
            };
            match key {
                // An explicit 0 is honored and yields an empty forecast; the
                // defaults apply only when the parameter is absent or does
                // not parse.
                "duration" => match value.parse::<i64>() {
                    Ok(n) => params.duration = Some(n.max(0) as usize),
                    Err(_) => debug!("ignoring weather duration {value:?}"),
                },
                "tempUnit" => {
                    if value != "CELSIUS" {
                        debug!("unsupported tempUnit {value:?}, using CELSIUS");
                    }
                }
                "speedUnit" => {
                    if value != "METERS_PER_SECOND" {
                        debug!("unsupported speedUnit {value:?}, using METERS_PER_SECOND");
                    }
                }
                // Sent by the watch on every poll, not consumed here.
                "lat" | "lon" | "provider" | "timesOfInterest" => {}
                other => debug!("ignoring weather query key {other:?}"),
            }
        }
        params
    }
}

/// Exact conversion. The firmware tolerates the 0.15 degree shift older hosts
/// dropped by rounding the constant.
pub fn kelvin_to_celsius(kelvin: f32) -> f32 {
    kelvin - 273.15
}

fn mps_to_kph(mps: f32) -> f32 {
    mps * 3.6
}

fn hpa_to_inhg(hpa: f32) -> f32 {
    hpa * 0.02953
}

/// ISO weekday from epoch seconds, UTC: 1 is Monday, 7 is Sunday.
pub fn day_of_week(epoch_seconds: u64) -> u8 {
    ((epoch_seconds / 86_400 + 3) % 7 + 1) as u8
}

/// Watch icon id for an OpenWeatherMap-style condition code. Unlisted codes
/// render as icon 35, the generic one.
pub fn condition_to_icon(code: u16) -> u8 {
    match code {
        200..=202 | 210..=212 | 221 | 230..=232 => 27,
        300..=302 | 310..=314 | 321 | 500..=504 | 520..=522 | 531 => 17,
        511 | 615 | 616 | 906 => 40,
        600..=602 | 611 | 612 | 620..=622 => 38,
        701 | 711 | 721 | 731 | 741 | 751 | 761 | 762 => 47,
        771 | 781 | 900..=902 | 905 | 951..=962 => 46,
        800 | 904 => 5,
        801 | 802 => 8,
        803 | 804 => 15,
        _ => 35,
    }
}
