use std::sync::Arc;

use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

pub const TOOL_NAME: &str = "get-weather";

const QWEATHER_API_BASE: &str = "https://api.qweather.com/v7";
const QWEATHER_DEV_API_BASE: &str = "https://devapi.qweather.com/v7";

const SEPARATOR: &str = "------------------------";

/// Process-wide configuration, parsed once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub api_key: String,
    pub dev_mode: bool,
}

impl WeatherConfig {
    /// Scans command-line arguments for `--apiKey=<value>` and the `--dev`
    /// flag. Anything else is ignored.
    pub fn from_args(args: impl IntoIterator<Item = String>) -> Self {
        let mut api_key = String::new();
        let mut dev_mode = false;
        for arg in args {
            if let Some(key) = arg.strip_prefix("--apiKey=") {
                api_key = key.to_string();
            } else if arg == "--dev" {
                dev_mode = true;
            }
        }
        Self { api_key, dev_mode }
    }

    /// The `--dev` flag selects the free-subscription host.
    pub fn api_base(&self) -> &'static str {
        if self.dev_mode {
            QWEATHER_DEV_API_BASE
        } else {
            QWEATHER_API_BASE
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct FieldViolation {
    pub field: &'static str,
    pub reason: &'static str,
}

/// Aggregated argument violations. Validation never stops at the first bad
/// field, so the rendered message lists every one of them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .violations.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(#[from] ValidationError),
}

impl From<ServerError> for McpError {
    fn from(err: ServerError) -> Self {
        McpError::invalid_params(err.to_string(), None)
    }
}

/// Upstream failures are never surfaced to the MCP caller as protocol
/// errors; the tool handler logs them and answers with a fetch-failure text.
#[derive(Debug, thiserror::Error)]
enum UpstreamError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
}

/// Forecast horizon requested by the caller, matching the QWeather resource
/// paths one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[schemars(inline)]
pub enum Period {
    #[default]
    #[serde(rename = "now")]
    Now,
    #[serde(rename = "24h")]
    Hours24,
    #[serde(rename = "72h")]
    Hours72,
    #[serde(rename = "168h")]
    Hours168,
    #[serde(rename = "3d")]
    Days3,
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "10d")]
    Days10,
    #[serde(rename = "15d")]
    Days15,
    #[serde(rename = "30d")]
    Days30,
}

impl Period {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "now" => Some(Self::Now),
            "24h" => Some(Self::Hours24),
            "72h" => Some(Self::Hours72),
            "168h" => Some(Self::Hours168),
            "3d" => Some(Self::Days3),
            "7d" => Some(Self::Days7),
            "10d" => Some(Self::Days10),
            "15d" => Some(Self::Days15),
            "30d" => Some(Self::Days30),
            _ => None,
        }
    }

    /// Wire token, also the resource path segment on the QWeather API.
    pub fn as_token(self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::Hours24 => "24h",
            Self::Hours72 => "72h",
            Self::Hours168 => "168h",
            Self::Days3 => "3d",
            Self::Days7 => "7d",
            Self::Days10 => "10d",
            Self::Days15 => "15d",
            Self::Days30 => "30d",
        }
    }

    /// Classifies the token into its response shape. Daily spans carry the
    /// day count shown in forecast headers, which comes from the token, not
    /// from however many entries upstream actually returns.
    fn kind(self) -> ForecastKind {
        match self {
            Self::Now => ForecastKind::Current,
            Self::Hours24 | Self::Hours72 | Self::Hours168 => ForecastKind::Hourly,
            Self::Days3 => ForecastKind::Daily { day_count: 3 },
            Self::Days7 => ForecastKind::Daily { day_count: 7 },
            Self::Days10 => ForecastKind::Daily { day_count: 10 },
            Self::Days15 => ForecastKind::Daily { day_count: 15 },
            Self::Days30 => ForecastKind::Daily { day_count: 30 },
        }
    }
}

/// Response shape selected by a period token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForecastKind {
    Current,
    Hourly,
    Daily { day_count: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WeatherParams {
    #[schemars(description = "逗号分隔的经纬度信息 (e.g., 116.40,39.90)")]
    pub location: String,
    #[schemars(
        description = "预报天数，now为实时天气，24h为24小时预报，72h为72小时预报，168h为168小时预报，3d为3天预报，以此类推"
    )]
    #[serde(default)]
    pub days: Period,
}

fn parse_weather_args(args: Option<&JsonObject>) -> Result<WeatherParams, ValidationError> {
    let mut violations = Vec::new();

    let location = match args.and_then(|a| a.get("location")) {
        Some(Value::String(location)) => Some(location.clone()),
        Some(_) => {
            violations.push(FieldViolation {
                field: "location",
                reason: "expected a string",
            });
            None
        }
        None => {
            violations.push(FieldViolation {
                field: "location",
                reason: "required but missing",
            });
            None
        }
    };

    let days = match args.and_then(|a| a.get("days")) {
        None => Some(Period::default()),
        Some(Value::String(token)) => match Period::from_token(token) {
            Some(period) => Some(period),
            None => {
                violations.push(FieldViolation {
                    field: "days",
                    reason: "must be one of now, 24h, 72h, 168h, 3d, 7d, 10d, 15d, 30d",
                });
                None
            }
        },
        Some(_) => {
            violations.push(FieldViolation {
                field: "days",
                reason: "expected a string",
            });
            None
        }
    };

    match (location, days) {
        (Some(location), Some(days)) => Ok(WeatherParams { location, days }),
        _ => Err(ValidationError { violations }),
    }
}

// QWeather v7 JSON response structures. Fields the formatter never touches
// are left out; serde ignores them.
#[derive(Debug, Deserialize)]
struct NowResponse {
    #[serde(default)]
    now: Option<NowObservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NowObservation {
    obs_time: String,
    temp: String,
    feels_like: String,
    text: String,
    wind_dir: String,
    wind_scale: String,
}

#[derive(Debug, Deserialize)]
struct HourlyResponse {
    #[serde(default)]
    hourly: Vec<HourlyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HourlyEntry {
    fx_time: String,
    temp: String,
    text: String,
    wind_dir: String,
    wind_scale: String,
    humidity: String,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    #[serde(default)]
    daily: Vec<DailyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyEntry {
    fx_date: String,
    temp_max: String,
    temp_min: String,
    text_day: String,
    text_night: String,
    wind_dir_day: String,
    wind_scale_day: String,
    wind_dir_night: String,
    wind_scale_night: String,
}

fn format_now(location: &str, now: &NowObservation) -> String {
    format!(
        "地点: {}\n观测时间: {}\n天气: {}\n温度: {}°C\n体感温度: {}°C\n风向: {}\n风力: {}级",
        location, now.obs_time, now.text, now.temp, now.feels_like, now.wind_dir, now.wind_scale
    )
}

fn format_hourly(location: &str, period: Period, hours: &[HourlyEntry]) -> String {
    let blocks = hours
        .iter()
        .map(|hour| {
            format!(
                "时间: {}\n天气: {}\n温度: {}°C\n湿度: {}%\n风向: {} {}级\n{}",
                hour.fx_time,
                hour.text,
                hour.temp,
                hour.humidity,
                hour.wind_dir,
                hour.wind_scale,
                SEPARATOR
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("地点: {}\n{}小时预报:\n{}", location, period.as_token(), blocks)
}

fn format_daily(location: &str, day_count: u32, days: &[DailyEntry]) -> String {
    let blocks = days
        .iter()
        .map(|day| {
            format!(
                "日期: {}\n白天天气: {}\n夜间天气: {}\n最高温度: {}°C\n最低温度: {}°C\n白天风向: {} {}级\n夜间风向: {} {}级\n{}",
                day.fx_date,
                day.text_day,
                day.text_night,
                day.temp_max,
                day.temp_min,
                day.wind_dir_day,
                day.wind_scale_day,
                day.wind_dir_night,
                day.wind_scale_night,
                SEPARATOR
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("地点: {}\n{}天预报:\n{}", location, day_count, blocks)
}

fn weather_input_schema() -> Arc<JsonObject> {
    match serde_json::to_value(schemars::schema_for!(WeatherParams)) {
        Ok(Value::Object(schema)) => Arc::new(schema),
        _ => Arc::new(JsonObject::default()),
    }
}

fn weather_tool() -> Tool {
    Tool::new(TOOL_NAME, "获取中国国内的天气预报", weather_input_schema())
}

fn tool_catalog() -> ListToolsResult {
    ListToolsResult {
        meta: None,
        next_cursor: None,
        tools: vec![weather_tool()],
    }
}

#[derive(Debug)]
pub struct WeatherServer {
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl WeatherServer {
    pub fn new(config: WeatherConfig) -> Self {
        let api_base = config.api_base().to_string();
        Self::with_api_base(config, api_base)
    }

    /// Same server, but pointed at an explicit base URL instead of the host
    /// selected by `dev_mode`. Integration tests aim this at a mock server.
    pub fn with_api_base(config: WeatherConfig, api_base: impl Into<String>) -> Self {
        Self {
            api_key: config.api_key,
            api_base: api_base.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        period: Period,
        location: &str,
    ) -> Result<T, UpstreamError> {
        let url = format!(
            "{}/weather/{}?location={}&key={}",
            self.api_base,
            period.as_token(),
            urlencoding::encode(location),
            self.api_key
        );

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }

        Ok(response.json::<T>().await?)
    }

    async fn current_weather(&self, location: &str) -> String {
        match self.fetch::<NowResponse>(Period::Now, location).await {
            Ok(NowResponse { now: Some(now) }) => format_now(location, &now),
            Ok(NowResponse { now: None }) => format!("无法获取 {} 的天气数据", location),
            Err(err) => {
                tracing::warn!(location, error = %err, "current weather request failed");
                format!("无法获取 {} 的天气数据", location)
            }
        }
    }

    async fn hourly_forecast(&self, location: &str, period: Period) -> String {
        match self.fetch::<HourlyResponse>(period, location).await {
            Ok(response) if !response.hourly.is_empty() => {
                format_hourly(location, period, &response.hourly)
            }
            Ok(_) => format!("无法获取 {} 的逐小时天气预报数据", location),
            Err(err) => {
                tracing::warn!(location, error = %err, "hourly forecast request failed");
                format!("无法获取 {} 的逐小时天气预报数据", location)
            }
        }
    }

    async fn daily_forecast(&self, location: &str, period: Period, day_count: u32) -> String {
        match self.fetch::<DailyResponse>(period, location).await {
            Ok(response) if !response.daily.is_empty() => {
                format_daily(location, day_count, &response.daily)
            }
            Ok(_) => format!("无法获取 {} 的天气预报数据", location),
            Err(err) => {
                tracing::warn!(location, error = %err, "daily forecast request failed");
                format!("无法获取 {} 的天气预报数据", location)
            }
        }
    }

    /// Executes a tool call and returns the text payload. Bad caller input
    /// is a hard error; upstream trouble degrades to a fetch-failure text.
    pub async fn run_tool(
        &self,
        name: &str,
        arguments: Option<&JsonObject>,
    ) -> Result<String, ServerError> {
        if name != TOOL_NAME {
            return Err(ServerError::UnknownTool(name.to_string()));
        }

        let params = parse_weather_args(arguments)?;

        let text = match params.days.kind() {
            ForecastKind::Current => self.current_weather(&params.location).await,
            ForecastKind::Hourly => self.hourly_forecast(&params.location, params.days).await,
            ForecastKind::Daily { day_count } => {
                self.daily_forecast(&params.location, params.days, day_count).await
            }
        };

        Ok(text)
    }
}

impl ServerHandler for WeatherServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some("Chinese weather forecasts served from the QWeather API".into()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(tool_catalog())
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let text = self
            .run_tool(&request.name, request.arguments.as_ref())
            .await?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn all_nine_period_tokens_parse() {
        let cases = [
            ("now", Period::Now),
            ("24h", Period::Hours24),
            ("72h", Period::Hours72),
            ("168h", Period::Hours168),
            ("3d", Period::Days3),
            ("7d", Period::Days7),
            ("10d", Period::Days10),
            ("15d", Period::Days15),
            ("30d", Period::Days30),
        ];
        for (token, period) in cases {
            assert_eq!(Period::from_token(token), Some(period));
            assert_eq!(period.as_token(), token);
        }
    }

    #[test]
    fn unknown_period_token_is_a_days_violation() {
        assert_eq!(Period::from_token("48h"), None);

        let err = parse_weather_args(Some(&args(json!({
            "location": "beijing",
            "days": "48h",
        }))))
        .unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "days");
    }

    #[test]
    fn day_counts_come_from_the_token() {
        assert_eq!(Period::Days3.kind(), ForecastKind::Daily { day_count: 3 });
        assert_eq!(Period::Days7.kind(), ForecastKind::Daily { day_count: 7 });
        assert_eq!(Period::Days10.kind(), ForecastKind::Daily { day_count: 10 });
        assert_eq!(Period::Days15.kind(), ForecastKind::Daily { day_count: 15 });
        assert_eq!(Period::Days30.kind(), ForecastKind::Daily { day_count: 30 });
        assert_eq!(Period::Now.kind(), ForecastKind::Current);
        assert_eq!(Period::Hours24.kind(), ForecastKind::Hourly);
        assert_eq!(Period::Hours168.kind(), ForecastKind::Hourly);
    }

    #[test]
    fn missing_location_fails_validation() {
        let err = parse_weather_args(Some(&args(json!({})))).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "location");

        let err = parse_weather_args(None).unwrap_err();
        assert_eq!(err.violations[0].field, "location");
    }

    #[test]
    fn non_string_location_fails_validation() {
        let err = parse_weather_args(Some(&args(json!({ "location": 42 })))).unwrap_err();
        assert_eq!(err.violations[0].field, "location");
        assert!(err.to_string().contains("expected a string"));
    }

    #[test]
    fn missing_days_defaults_to_now() {
        let params = parse_weather_args(Some(&args(json!({ "location": "116.40,39.90" }))))
            .unwrap();
        assert_eq!(params.days, Period::Now);
        assert_eq!(params.location, "116.40,39.90");
    }

    #[test]
    fn violations_accumulate_instead_of_short_circuiting() {
        let err = parse_weather_args(Some(&args(json!({ "days": 7 })))).unwrap_err();
        assert_eq!(err.violations.len(), 2);

        let rendered = err.to_string();
        assert!(rendered.contains("location:"));
        assert!(rendered.contains("days:"));
        assert!(rendered.contains(", "));
    }

    #[test]
    fn catalog_lists_exactly_the_weather_tool() {
        let catalog = tool_catalog();
        assert_eq!(catalog.tools.len(), 1);
        assert_eq!(catalog.tools[0].name, TOOL_NAME);
        assert!(catalog.next_cursor.is_none());
    }

    #[test]
    fn input_schema_declares_both_parameters() {
        let schema = weather_input_schema();

        assert_eq!(schema["properties"]["location"]["type"], "string");
        assert_eq!(schema["required"], json!(["location"]));

        let tokens = schema["properties"]["days"]["enum"].as_array().unwrap();
        assert_eq!(tokens.len(), 9);
        assert!(tokens.contains(&json!("now")));
        assert!(tokens.contains(&json!("30d")));
        assert_eq!(schema["properties"]["days"]["default"], "now");
    }

    #[test]
    fn now_formatting_has_fixed_label_order_and_units() {
        let now = NowObservation {
            obs_time: "2024-01-01T08:00".into(),
            temp: "5".into(),
            feels_like: "2".into(),
            text: "晴".into(),
            wind_dir: "北风".into(),
            wind_scale: "3".into(),
        };

        assert_eq!(
            format_now("116.40,39.90", &now),
            "地点: 116.40,39.90\n观测时间: 2024-01-01T08:00\n天气: 晴\n温度: 5°C\n体感温度: 2°C\n风向: 北风\n风力: 3级"
        );
    }

    fn hourly_entry(time: &str) -> HourlyEntry {
        HourlyEntry {
            fx_time: time.into(),
            temp: "10".into(),
            text: "多云".into(),
            wind_dir: "东南风".into(),
            wind_scale: "2".into(),
            humidity: "65".into(),
        }
    }

    #[test]
    fn hourly_formatting_keeps_upstream_order() {
        let hours = [
            hourly_entry("2024-01-01T09:00"),
            hourly_entry("2024-01-01T10:00"),
            hourly_entry("2024-01-01T11:00"),
        ];
        let text = format_hourly("beijing", Period::Hours24, &hours);

        assert!(text.starts_with("地点: beijing\n24h小时预报:\n"));
        assert_eq!(text.matches(SEPARATOR).count(), 3);
        assert!(text.contains("湿度: 65%"));
        assert!(text.contains("风向: 东南风 2级"));

        let first = text.find("09:00").unwrap();
        let second = text.find("10:00").unwrap();
        let third = text.find("11:00").unwrap();
        assert!(first < second && second < third);
    }

    #[test]
    fn daily_header_count_ignores_entry_count() {
        let day = DailyEntry {
            fx_date: "2024-01-01".into(),
            temp_max: "8".into(),
            temp_min: "-2".into(),
            text_day: "晴".into(),
            text_night: "多云".into(),
            wind_dir_day: "北风".into(),
            wind_scale_day: "3".into(),
            wind_dir_night: "西北风".into(),
            wind_scale_night: "2".into(),
        };

        let text = format_daily("beijing", 7, std::slice::from_ref(&day));
        assert!(text.starts_with("地点: beijing\n7天预报:\n"));
        assert!(text.contains("最高温度: 8°C"));
        assert!(text.contains("最低温度: -2°C"));
        assert!(text.contains("白天风向: 北风 3级"));
        assert!(text.contains("夜间风向: 西北风 2级"));
        assert_eq!(text.matches(SEPARATOR).count(), 1);
    }

    #[test]
    fn config_parses_api_key_and_dev_flag() {
        let config = WeatherConfig::from_args(
            ["--apiKey=abc123", "--dev", "--unrelated"]
                .map(String::from),
        );
        assert_eq!(config.api_key, "abc123");
        assert!(config.dev_mode);
        assert_eq!(config.api_base(), "https://devapi.qweather.com/v7");

        let config = WeatherConfig::from_args(Vec::<String>::new());
        assert_eq!(config.api_key, "");
        assert!(!config.dev_mode);
        assert_eq!(config.api_base(), "https://api.qweather.com/v7");
    }

    #[tokio::test]
    async fn unknown_tool_names_the_requested_tool() {
        let server = WeatherServer::new(WeatherConfig::from_args(Vec::<String>::new()));
        let err = server.run_tool("get-forecast", None).await.unwrap_err();

        match &err {
            ServerError::UnknownTool(name) => assert_eq!(name, "get-forecast"),
            other => panic!("expected UnknownTool, got {other:?}"),
        }
        assert_eq!(err.to_string(), "Unknown tool: get-forecast");
    }

    #[tokio::test]
    async fn invalid_arguments_propagate_as_errors() {
        let server = WeatherServer::new(WeatherConfig::from_args(Vec::<String>::new()));
        let bad = args(json!({ "days": "now" }));
        let err = server.run_tool(TOOL_NAME, Some(&bad)).await.unwrap_err();

        assert!(matches!(err, ServerError::InvalidArguments(_)));
        assert!(err.to_string().starts_with("Invalid arguments: location"));
    }
}
