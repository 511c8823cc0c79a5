//! Output encodings of a [`SelectResult`].
//!
//! Encoded formats are exposed as a [`StreamFactory`]: every call produces a
//! fresh byte stream whose chunks are encoded as they are pulled.

use crate::error::{DataError, Result};
use crate::types::SelectResult;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{json, Map, Value};
use std::fmt;
use std::io;
use std::sync::Arc;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    List,
    Dict,
    Csv,
    Json,
    JsonLines,
    GeoJson,
    RawDict,
    RawList,
}

impl OutputFormat {
    /// Case-insensitive, ignoring underscores; absent means `list`
    pub fn parse(name: Option<&str>) -> Result<Self> {
        let Some(name) = name else {
            return Ok(OutputFormat::List);
        };
        match name.trim().to_lowercase().replace('_', "").as_str() {
            "" | "list" => Ok(OutputFormat::List),
            "dict" => Ok(OutputFormat::Dict),
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            "jsonlines" => Ok(OutputFormat::JsonLines),
            "geojson" => Ok(OutputFormat::GeoJson),
            "rawdict" => Ok(OutputFormat::RawDict),
            "rawlist" => Ok(OutputFormat::RawList),
            _ => Err(DataError::UnknownFormat(name.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::List => "list",
            OutputFormat::Dict => "dict",
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
            OutputFormat::JsonLines => "jsonlines",
            OutputFormat::GeoJson => "geojson",
            OutputFormat::RawDict => "rawdict",
            OutputFormat::RawList => "rawlist",
        }
    }

    /// MIME type of the encoded stream; raw formats have none
    pub fn mime_type(self) -> Option<&'static str> {
        match self {
            OutputFormat::List | OutputFormat::Dict | OutputFormat::Json => {
                Some("application/json")
            }
            OutputFormat::Csv => Some("text/csv"),
            OutputFormat::JsonLines => Some("text/plain"),
            OutputFormat::GeoJson => Some("application/vnd.geo+json"),
            OutputFormat::RawDict | OutputFormat::RawList => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces a new lazy byte stream on every call
#[derive(Clone)]
pub struct StreamFactory(Arc<dyn Fn() -> ByteStream + Send + Sync>);

impl StreamFactory {
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn() -> ByteStream + Send + Sync + 'static,
    {
        Self(Arc::new(producer))
    }

    pub fn stream(&self) -> ByteStream {
        (self.0)()
    }

    /// Drain a fresh stream into one buffer
    pub async fn collect(&self) -> io::Result<Vec<u8>> {
        self.stream()
            .try_fold(Vec::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await
    }
}

impl fmt::Debug for StreamFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamFactory")
    }
}

/// An encoded result
#[derive(Debug)]
pub enum FormattedOutput {
    Stream {
        factory: StreamFactory,
        mime_type: &'static str,
    },
    /// Row lists handed over in-process
    RawList(Vec<Vec<Value>>),
    /// Row maps handed over in-process
    RawDict(Vec<Map<String, Value>>),
}

impl FormattedOutput {
    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            FormattedOutput::Stream { mime_type, .. } => Some(*mime_type),
            _ => None,
        }
    }

    pub fn stream_factory(&self) -> Option<&StreamFactory> {
        match self {
            FormattedOutput::Stream { factory, .. } => Some(factory),
            _ => None,
        }
    }
}

fn to_io(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn encode_json(value: &Value, pretty: bool) -> io::Result<Bytes> {
    let encoded = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    };
    encoded.map(Bytes::from).map_err(to_io)
}

fn chunks<I>(iter: I) -> ByteStream
where
    I: Iterator<Item = io::Result<Bytes>> + Send + 'static,
{
    stream::iter(iter).boxed()
}

/// Encode `result` in `format`
///
/// Streamed formats convert each row as its chunk is pulled.
pub fn format_result(result: SelectResult, format: OutputFormat, pretty: bool) -> FormattedOutput {
    let factory = match format {
        OutputFormat::RawList => return FormattedOutput::RawList(result.rows_as_lists()),
        OutputFormat::RawDict => return FormattedOutput::RawDict(result.rows_as_dicts()),
        OutputFormat::List | OutputFormat::Dict => {
            let result = Arc::new(result);
            StreamFactory::new(move || {
                let result = result.clone();
                stream::once(async move { encode_json(&envelope(&result, format), pretty) }).boxed()
            })
        }
        OutputFormat::Json => {
            let rows = RowSource::new(result);
            StreamFactory::new(move || json_array_stream(rows.clone(), pretty))
        }
        OutputFormat::JsonLines => {
            let rows = RowSource::new(result);
            StreamFactory::new(move || {
                let rows = rows.clone();
                chunks((0..rows.len()).map(move |i| {
                    let mut line = serde_json::to_vec(&rows.dict(i)).map_err(to_io)?;
                    line.push(b'\n');
                    Ok(Bytes::from(line))
                }))
            })
        }
        OutputFormat::Csv => {
            let rows = RowSource::new(result);
            StreamFactory::new(move || csv_stream(rows.clone()))
        }
        OutputFormat::GeoJson => {
            let rows = RowSource::new(result);
            StreamFactory::new(move || geojson_stream(rows.clone()))
        }
    };
    FormattedOutput::Stream {
        factory,
        mime_type: format.mime_type().unwrap_or("application/octet-stream"),
    }
}

/// Shared result plus its column names, converted one row at a time
#[derive(Clone)]
struct RowSource {
    result: Arc<SelectResult>,
    names: Arc<Vec<String>>,
}

impl RowSource {
    fn new(result: SelectResult) -> Self {
        let names = Arc::new(result.column_names());
        Self {
            result: Arc::new(result),
            names,
        }
    }

    fn len(&self) -> usize {
        self.result.data.len()
    }

    fn dict(&self, index: usize) -> Map<String, Value> {
        self.result.dict_row(index, &self.names).unwrap_or_default()
    }

    fn list(&self, index: usize) -> Vec<Value> {
        self.result.list_row(index, &self.names).unwrap_or_default()
    }
}

fn envelope(result: &SelectResult, format: OutputFormat) -> Value {
    let data = match format {
        OutputFormat::Dict => json!(result.rows_as_dicts()),
        _ => json!(result.rows_as_lists()),
    };
    json!({
        "limit": result.limit,
        "offset": result.offset,
        "sort": result.sort.iter().map(|key| key.to_json()).collect::<Vec<_>>(),
        "fields": result.fields.iter().map(|column| column.to_json()).collect::<Vec<_>>(),
        "columns": result.columns,
        "data": data,
        "datacount": result.datacount,
        "format": format.as_str(),
    })
}

fn json_array_stream(rows: RowSource, pretty: bool) -> ByteStream {
    if pretty {
        return stream::once(async move {
            let all: Vec<Map<String, Value>> = (0..rows.len()).map(|i| rows.dict(i)).collect();
            serde_json::to_vec_pretty(&all)
                .map(Bytes::from)
                .map_err(to_io)
        })
        .boxed();
    }
    let body = (0..rows.len()).map(move |i| {
        let mut chunk = Vec::new();
        if i > 0 {
            chunk.push(b',');
        }
        serde_json::to_writer(&mut chunk, &rows.dict(i)).map_err(to_io)?;
        Ok(Bytes::from(chunk))
    });
    chunks(
        std::iter::once(Ok(Bytes::from_static(b"[")))
            .chain(body)
            .chain(std::iter::once(Ok(Bytes::from_static(b"]")))),
    )
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn csv_line<I, S>(record: I) -> io::Result<Bytes>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut wtr = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    wtr.write_record(record)?;
    let data = wtr.into_inner().map_err(|e| e.into_error())?;
    Ok(Bytes::from(data))
}

fn csv_stream(rows: RowSource) -> ByteStream {
    let header = csv_line(rows.names.iter());
    let body = (0..rows.len()).map(move |i| csv_line(rows.list(i).iter().map(csv_cell)));
    chunks(std::iter::once(header).chain(body))
}

/// Cell as geometry JSON text, when it looks like one
fn geometry_candidate(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (trimmed.starts_with('{') && trimmed.ends_with('}')).then(|| trimmed.to_string())
        }
        Value::Object(_) => Some(value.to_string()),
        _ => None,
    }
}

fn row_geometries(rows: &RowSource, index: usize) -> Vec<String> {
    rows.list(index).iter().filter_map(geometry_candidate).collect()
}

fn geojson_stream(rows: RowSource) -> ByteStream {
    let is_feature = (0..rows.len())
        .find_map(|i| row_geometries(&rows, i).into_iter().next())
        .and_then(|first| serde_json::from_str::<Value>(&first).ok())
        .is_some_and(|first| first.get("type") == Some(&Value::from("Feature")));
    let header: &'static [u8] = if is_feature {
        br#"{"type":"FeatureCollection","features":["#
    } else {
        br#"{"type":"GeometryCollection","geometries":["#
    };
    let body = (0..rows.len())
        .flat_map(move |i| row_geometries(&rows, i))
        .enumerate()
        .map(|(i, candidate)| {
            let chunk = if i == 0 {
                candidate
            } else {
                format!(",{candidate}")
            };
            Ok(Bytes::from(chunk))
        });
    chunks(
        std::iter::once(Ok(Bytes::from_static(header)))
            .chain(body)
            .chain(std::iter::once(Ok(Bytes::from_static(b"]}")))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, OutputColumn, SortDirection, SortKey};
    use crate::types::Rows;

    fn towns() -> SelectResult {
        SelectResult::new(
            Some(5),
            0,
            vec![SortKey::new(Expr::field("town"), SortDirection::Ascending)],
            vec![OutputColumn::field("town"), OutputColumn::field("pop2010")],
            Rows::List(vec![
                vec![json!("BOSTON"), json!(617594)],
                vec![json!("BOURNE, MA"), Value::Null],
            ]),
        )
    }

    async fn text(output: &FormattedOutput) -> String {
        let bytes = output.stream_factory().unwrap().collect().await.unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_format_names() {
        assert_eq!(OutputFormat::parse(None).unwrap(), OutputFormat::List);
        assert_eq!(
            OutputFormat::parse(Some("JSON_Lines")).unwrap(),
            OutputFormat::JsonLines
        );
        assert_eq!(
            OutputFormat::parse(Some("raw_dict")).unwrap(),
            OutputFormat::RawDict
        );
        assert!(matches!(
            OutputFormat::parse(Some("xml")),
            Err(DataError::UnknownFormat(_))
        ));
        assert_eq!(OutputFormat::GeoJson.mime_type(), Some("application/vnd.geo+json"));
        assert_eq!(OutputFormat::RawList.mime_type(), None);
    }

    #[tokio::test]
    async fn test_list_envelope() {
        let output = format_result(towns(), OutputFormat::List, false);
        assert_eq!(output.mime_type(), Some("application/json"));
        let value: Value = serde_json::from_str(&text(&output).await).unwrap();
        assert_eq!(value["format"], json!("list"));
        assert_eq!(value["datacount"], json!(2));
        assert_eq!(value["fields"], json!(["town", "pop2010"]));
        assert_eq!(value["columns"], json!({"town": 0, "pop2010": 1}));
        assert_eq!(value["sort"], json!([["town", 1]]));
        assert_eq!(value["data"][0], json!(["BOSTON", 617594]));
    }

    #[tokio::test]
    async fn test_dict_envelope_pretty() {
        let output = format_result(towns(), OutputFormat::Dict, true);
        let body = text(&output).await;
        assert!(body.contains("\n  \"limit\": 5"));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["data"][1], json!({"town": "BOURNE, MA", "pop2010": null}));
    }

    #[tokio::test]
    async fn test_csv() {
        let output = format_result(towns(), OutputFormat::Csv, false);
        assert_eq!(output.mime_type(), Some("text/csv"));
        assert_eq!(
            text(&output).await,
            "town,pop2010\nBOSTON,617594\n\"BOURNE, MA\",\n"
        );
    }

    #[tokio::test]
    async fn test_json_and_jsonlines() {
        let output = format_result(towns(), OutputFormat::Json, false);
        let value: Value = serde_json::from_str(&text(&output).await).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0]["town"], json!("BOSTON"));

        let output = format_result(towns(), OutputFormat::JsonLines, false);
        let body = text(&output).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"town":"BOSTON","pop2010":617594}"#);
    }

    #[tokio::test]
    async fn test_dict_rows_stream_in_column_order() {
        let mut first = Map::new();
        first.insert("pop2010".to_string(), json!(617594));
        first.insert("town".to_string(), json!("BOSTON"));
        let mut second = Map::new();
        second.insert("town".to_string(), json!("WESTON"));
        let result = SelectResult::new(
            None,
            0,
            Vec::new(),
            vec![OutputColumn::field("town"), OutputColumn::field("pop2010")],
            Rows::Dict(vec![first, second]),
        );
        let output = format_result(result.clone(), OutputFormat::Csv, false);
        assert_eq!(
            text(&output).await,
            "town,pop2010\nBOSTON,617594\nWESTON,\n"
        );
        let output = format_result(result, OutputFormat::JsonLines, false);
        assert_eq!(
            text(&output).await.lines().nth(1),
            Some(r#"{"town":"WESTON"}"#)
        );
    }

    #[tokio::test]
    async fn test_empty_json_array() {
        let result = SelectResult::new(
            Some(0),
            0,
            Vec::new(),
            vec![OutputColumn::field("town")],
            Rows::List(Vec::new()),
        );
        let output = format_result(result, OutputFormat::Json, false);
        assert_eq!(text(&output).await, "[]");
    }

    #[tokio::test]
    async fn test_stream_factory_is_repeatable() {
        let output = format_result(towns(), OutputFormat::Csv, false);
        let first = text(&output).await;
        let second = text(&output).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_geojson_collections() {
        let geometry = SelectResult::new(
            None,
            0,
            Vec::new(),
            vec![OutputColumn::field("shape")],
            Rows::List(vec![
                vec![json!(r#"{"type":"Point","coordinates":[1,2]}"#)],
                vec![json!("not geometry")],
                vec![json!({"type": "Point", "coordinates": [3, 4]})],
            ]),
        );
        let output = format_result(geometry, OutputFormat::GeoJson, false);
        let value: Value = serde_json::from_str(&text(&output).await).unwrap();
        assert_eq!(value["type"], json!("GeometryCollection"));
        assert_eq!(value["geometries"].as_array().unwrap().len(), 2);

        let features = SelectResult::new(
            None,
            0,
            Vec::new(),
            vec![OutputColumn::field("feature")],
            Rows::List(vec![vec![json!({"type": "Feature", "geometry": null, "properties": {}})]]),
        );
        let output = format_result(features, OutputFormat::GeoJson, false);
        let value: Value = serde_json::from_str(&text(&output).await).unwrap();
        assert_eq!(value["type"], json!("FeatureCollection"));
        assert_eq!(value["features"].as_array().unwrap().len(), 1);

        let empty = SelectResult::new(None, 0, Vec::new(), Vec::new(), Rows::List(Vec::new()));
        let output = format_result(empty, OutputFormat::GeoJson, false);
        assert_eq!(
            text(&output).await,
            r#"{"type":"GeometryCollection","geometries":[]}"#
        );
    }

    #[test]
    fn test_raw_formats() {
        match format_result(towns(), OutputFormat::RawDict, false) {
            FormattedOutput::RawDict(rows) => {
                assert_eq!(rows[0].get("pop2010"), Some(&json!(617594)))
            }
            other => panic!("unexpected {other:?}"),
        }
        match format_result(towns(), OutputFormat::RawList, false) {
            FormattedOutput::RawList(rows) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
