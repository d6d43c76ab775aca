//! Stand-in for the event-processing engine used by the integration tests.
//!
//! Understands the command line the harness builds: it connects to every
//! `unix` input of the `-e` pipeline, decodes lines with the input's codec,
//! applies tags and fields, and writes each event as a JSON line to the file
//! output selected by the event's stream metadata. Events are numbered when
//! the config directory carries the sequence filter.
//!
//! `FAKE_ENGINE_EXIT=fatal` fails before reading any input;
//! `FAKE_ENGINE_EXIT=benign` processes everything and then exits with the
//! closed-stream IOError the real engine sometimes reports on shutdown.
//! `FAKE_ENGINE_SKIP_INPUT=<n>` never connects to the n-th input.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY: Duration = Duration::from_millis(20);
const SEQUENCE_FIELD: &str = "__lfv_id";
const METADATA_FIELD: &str = "@metadata";
const STREAM_METADATA_KEY: &str = "__lfv_testcase";
const BENIGN_RACE_LINE: &str = "[FATAL][logstash.runner] An unexpected error occurred! \
    {:error=>\"closed stream\", :class=>\"IOError\"}";

#[derive(Debug, Default)]
struct Args {
    pipeline: Option<String>,
    config_dir: Option<PathBuf>,
    log_path: Option<PathBuf>,
}

#[derive(Debug)]
struct Input {
    path: String,
    codec: String,
    tags: Vec<Value>,
    fields: Vec<(String, Value)>,
}

#[derive(Debug)]
struct Output {
    ordinal: String,
    path: PathBuf,
}

fn main() -> Result<(), BoxError> {
    let args = parse_args(std::env::args().skip(1))?;
    let mut log = match &args.log_path {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };
    if let Some(path) = &args.log_path {
        println!("Sending engine logs to {}", path.display());
    }

    let exit_mode = std::env::var("FAKE_ENGINE_EXIT").unwrap_or_default();
    if exit_mode == "fatal" {
        let message = "[FATAL][logstash.runner] pipeline failed to start: fake fatal error";
        write_log(&mut log, message);
        eprintln!("{message}");
        std::process::exit(1);
    }

    let pipeline = args.pipeline.as_deref().ok_or("missing -e pipeline")?;
    let (inputs, outputs) = parse_pipeline(pipeline)?;
    let numbered = match &args.config_dir {
        Some(dir) => config_mentions(dir, SEQUENCE_FIELD)?,
        None => false,
    };
    write_log(
        &mut log,
        &format!(
            "[INFO ][logstash.pipeline] starting with {} inputs, {} outputs",
            inputs.len(),
            outputs.len()
        ),
    );

    let mut env_names: Vec<String> = std::env::vars_os()
        .map(|(name, _)| name.to_string_lossy().into_owned())
        .collect();
    env_names.sort();
    write_log(
        &mut log,
        &format!("[DEBUG][logstash.runner] environment: {}", env_names.join(",")),
    );

    let skipped: Option<usize> = std::env::var("FAKE_ENGINE_SKIP_INPUT")
        .ok()
        .and_then(|value| value.parse().ok());

    let (event_tx, event_rx) = mpsc::channel::<Map<String, Value>>();
    let mut readers = Vec::with_capacity(inputs.len());
    for (ordinal, input) in inputs.into_iter().enumerate() {
        if skipped == Some(ordinal) {
            continue;
        }
        let tx = event_tx.clone();
        readers.push(thread::spawn(move || read_input(input, tx)));
    }
    drop(event_tx);

    let mut sinks: BTreeMap<String, File> = BTreeMap::new();
    let mut sequence: u64 = 0;
    for mut event in event_rx {
        if numbered {
            event.insert(SEQUENCE_FIELD.to_string(), Value::from(sequence));
            sequence += 1;
        }
        let ordinal = event
            .get(METADATA_FIELD)
            .and_then(|metadata| metadata.get(STREAM_METADATA_KEY))
            .and_then(Value::as_str)
            .map(str::to_string);
        event.remove(METADATA_FIELD);

        let Some(output) = ordinal
            .as_deref()
            .and_then(|ordinal| outputs.iter().find(|output| output.ordinal == ordinal))
        else {
            continue;
        };
        if !sinks.contains_key(&output.ordinal) {
            let file = OpenOptions::new().append(true).create(true).open(&output.path)?;
            sinks.insert(output.ordinal.clone(), file);
        }
        if let Some(sink) = sinks.get_mut(&output.ordinal) {
            let mut line = serde_json::to_vec(&Value::Object(event))?;
            line.push(b'\n');
            sink.write_all(&line)?;
            sink.flush()?;
        }
    }

    for reader in readers {
        if let Ok(Err(err)) = reader.join() {
            write_log(&mut log, &format!("[ERROR][logstash.inputs.unix] {err}"));
        }
    }

    if exit_mode == "benign" {
        write_log(&mut log, BENIGN_RACE_LINE);
        std::process::exit(1);
    }
    write_log(&mut log, "[INFO ][logstash.runner] pipeline terminated");
    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, BoxError> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-e" => parsed.pipeline = Some(args.next().ok_or("-e needs a value")?),
            "--config" | "-f" => {
                parsed.config_dir = Some(args.next().ok_or("--config needs a value")?.into())
            }
            "--log" | "-l" => parsed.log_path = Some(args.next().ok_or("--log needs a value")?.into()),
            "-w" => {
                args.next().ok_or("-w needs a value")?;
            }
            _ => {}
        }
    }
    Ok(parsed)
}

fn write_log(log: &mut Option<File>, line: &str) {
    if let Some(file) = log.as_mut() {
        let _ = writeln!(file, "{line}");
        let _ = file.flush();
    }
}

fn config_mentions(dir: &Path, needle: &str) -> Result<bool, BoxError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && fs::read_to_string(entry.path())?.contains(needle) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn read_input(input: Input, tx: mpsc::Sender<Map<String, Value>>) -> Result<(), BoxError> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let stream = loop {
        match UnixStream::connect(&input.path) {
            Ok(stream) => break stream,
            Err(err) if Instant::now() >= deadline => {
                return Err(format!("cannot connect to {}: {err}", input.path).into())
            }
            Err(_) => thread::sleep(CONNECT_RETRY),
        }
    };

    for line in BufReader::new(stream).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = decode(&input, &line);
        if tx.send(event).is_err() {
            break;
        }
    }
    Ok(())
}

fn decode(input: &Input, line: &str) -> Map<String, Value> {
    let mut event = if input.codec.starts_with("json") {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                let mut fields = Map::new();
                fields.insert("message".into(), Value::from(line));
                fields.insert("tags".into(), Value::from(vec!["_jsonparsefailure"]));
                fields
            }
        }
    } else {
        let mut fields = Map::new();
        fields.insert("message".into(), Value::from(line));
        fields
    };

    if !input.tags.is_empty() {
        let tags = event
            .entry("tags")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(tags) = tags {
            tags.extend(input.tags.iter().cloned());
        }
    }
    for (reference, value) in &input.fields {
        set_field(&mut event, reference, value.clone());
    }
    event
}

/// Set a plain name or a `[a][b]` field reference.
fn set_field(event: &mut Map<String, Value>, reference: &str, value: Value) {
    let segments: Vec<&str> = if reference.starts_with('[') {
        reference
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split("][")
            .collect()
    } else {
        vec![reference]
    };

    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut target = event;
    for segment in parents {
        let slot = target
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        target = next;
    }
    target.insert(last.to_string(), value);
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Word(String),
    Open,
    Close,
    ListOpen,
    ListClose,
    Comma,
    Arrow,
    Equals,
}

fn tokenize(text: &str) -> Result<Vec<Token>, BoxError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '{' => {
                tokens.push(Token::Open);
                i += 1;
            }
            '}' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '[' => {
                tokens.push(Token::ListOpen);
                i += 1;
            }
            ']' => {
                tokens.push(Token::ListClose);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'>') => {
                tokens.push(Token::Arrow);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Equals);
                i += 2;
            }
            '"' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string".into());
                }
                let literal: String = chars[start..=i].iter().collect();
                tokens.push(Token::Str(serde_json::from_str(&literal)?));
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '{' | '}' | '[' | ']' | ',' | '"' | '=')
                {
                    i += 1;
                }
                if start == i {
                    return Err(format!("unexpected character {c:?}").into());
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Result<Token, BoxError> {
        let token = self.tokens.get(self.pos).cloned().ok_or("unexpected end of pipeline")?;
        self.pos += 1;
        Ok(token)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expect(&mut self, expected: Token) -> Result<(), BoxError> {
        let token = self.next()?;
        if token != expected {
            return Err(format!("expected {expected:?}, found {token:?}").into());
        }
        Ok(())
    }

    fn word(&mut self) -> Result<String, BoxError> {
        match self.next()? {
            Token::Word(word) => Ok(word),
            other => Err(format!("expected a name, found {other:?}").into()),
        }
    }

    fn string(&mut self) -> Result<String, BoxError> {
        match self.next()? {
            Token::Str(text) | Token::Word(text) => Ok(text),
            other => Err(format!("expected a string, found {other:?}").into()),
        }
    }

    /// `{ key => value ... }`, the opening brace already consumed.
    fn hash(&mut self) -> Result<Vec<(String, Value)>, BoxError> {
        let mut entries = Vec::new();
        loop {
            if self.peek() == Some(&Token::Close) {
                self.pos += 1;
                return Ok(entries);
            }
            let key = self.string()?;
            self.expect(Token::Arrow)?;
            let value = self.value()?;
            entries.push((key, value));
        }
    }

    fn value(&mut self) -> Result<Value, BoxError> {
        match self.next()? {
            Token::Str(text) => Ok(Value::String(text)),
            Token::Word(word) => Ok(serde_json::from_str(&word).unwrap_or(Value::String(word))),
            Token::ListOpen => {
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::ListClose) => {
                            self.pos += 1;
                            return Ok(Value::Array(items));
                        }
                        Some(Token::Comma) => self.pos += 1,
                        _ => items.push(self.value()?),
                    }
                }
            }
            Token::Open => Ok(Value::Object(self.hash()?.into_iter().collect())),
            other => Err(format!("unexpected {other:?} in value position").into()),
        }
    }
}

fn parse_pipeline(text: &str) -> Result<(Vec<Input>, Vec<Output>), BoxError> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
    };

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    while parser.peek().is_some() {
        let section = parser.word()?;
        parser.expect(Token::Open)?;
        match section.as_str() {
            "input" => {
                while parser.peek() != Some(&Token::Close) {
                    let plugin = parser.word()?;
                    parser.expect(Token::Open)?;
                    let settings = parser.hash()?;
                    if plugin == "unix" {
                        inputs.push(input_from(settings)?);
                    }
                }
            }
            "output" => {
                while parser.peek() != Some(&Token::Close) {
                    parser.expect(Token::Word("if".into()))?;
                    while parser.next()? != Token::Equals {}
                    let ordinal = parser.string()?;
                    parser.expect(Token::Open)?;
                    let plugin = parser.word()?;
                    parser.expect(Token::Open)?;
                    let settings = parser.hash()?;
                    parser.expect(Token::Close)?;
                    if plugin == "file" {
                        let path = settings
                            .into_iter()
                            .find(|(key, _)| key == "path")
                            .and_then(|(_, value)| value.as_str().map(PathBuf::from))
                            .ok_or("file output without path")?;
                        outputs.push(Output { ordinal, path });
                    }
                }
            }
            other => return Err(format!("unknown section {other}").into()),
        }
        parser.expect(Token::Close)?;
    }
    Ok((inputs, outputs))
}

fn input_from(settings: Vec<(String, Value)>) -> Result<Input, BoxError> {
    let mut input = Input {
        path: String::new(),
        codec: "line".into(),
        tags: Vec::new(),
        fields: Vec::new(),
    };
    for (key, value) in settings {
        match (key.as_str(), value) {
            ("path", Value::String(path)) => input.path = path,
            ("codec", Value::String(codec)) => input.codec = codec,
            ("tags", Value::Array(tags)) => input.tags = tags,
            ("add_field", Value::Object(fields)) => input.fields = fields.into_iter().collect(),
            _ => {}
        }
    }
    if input.path.is_empty() {
        return Err("unix input without path".into());
    }
    Ok(input)
}
