use scroll::Pread;

use crate::DemuxError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, AmfValue)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, AmfValue)>),
    StrictArray(Vec<AmfValue>),
    Date(f64),
}

impl AmfValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property lookup for objects and ECMA arrays
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        match self {
            AmfValue::Object(props) | AmfValue::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    fn numbers(&self) -> Vec<f64> {
        match self {
            AmfValue::StrictArray(items) => items.iter().filter_map(AmfValue::as_f64).collect(),
            _ => Vec::new(),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            AmfValue::Number(n) => {
                out.push(MARKER_NUMBER);
                out.extend_from_slice(&n.to_be_bytes());
            }
            AmfValue::Boolean(b) => {
                out.push(MARKER_BOOLEAN);
                out.push(*b as u8);
            }
            AmfValue::String(s) => {
                if s.len() > u16::MAX as usize {
                    out.push(MARKER_LONG_STRING);
                    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    out.extend_from_slice(s.as_bytes());
                } else {
                    out.push(MARKER_STRING);
                    encode_short_string(s, out);
                }
            }
            AmfValue::Object(props) => {
                out.push(MARKER_OBJECT);
                encode_properties(props, out);
            }
            AmfValue::Null => out.push(MARKER_NULL),
            AmfValue::Undefined => out.push(MARKER_UNDEFINED),
            AmfValue::EcmaArray(props) => {
                out.push(MARKER_ECMA_ARRAY);
                out.extend_from_slice(&(props.len() as u32).to_be_bytes());
                encode_properties(props, out);
            }
            AmfValue::StrictArray(items) => {
                out.push(MARKER_STRICT_ARRAY);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            AmfValue::Date(millis) => {
                out.push(MARKER_DATE);
                out.extend_from_slice(&millis.to_be_bytes());
                out.extend_from_slice(&0i16.to_be_bytes());
            }
        }
    }
}

fn encode_short_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_properties(props: &[(String, AmfValue)], out: &mut Vec<u8>) {
    for (key, value) in props {
        encode_short_string(key, out);
        value.encode_into(out);
    }
    out.extend_from_slice(&[0, 0, MARKER_OBJECT_END]);
}

struct Decoder<'a> {
    data: &'a [u8],
    offset: usize,
}

fn amf_err(err: impl ToString) -> DemuxError {
    DemuxError::Amf {
        err: err.to_string(),
    }
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, DemuxError> {
        self.data
            .gread_with::<u8>(&mut self.offset, scroll::BE)
            .map_err(amf_err)
    }

    fn read_u16(&mut self) -> Result<u16, DemuxError> {
        self.data
            .gread_with::<u16>(&mut self.offset, scroll::BE)
            .map_err(amf_err)
    }

    fn read_u32(&mut self) -> Result<u32, DemuxError> {
        self.data
            .gread_with::<u32>(&mut self.offset, scroll::BE)
            .map_err(amf_err)
    }

    fn read_f64(&mut self) -> Result<f64, DemuxError> {
        self.data
            .gread_with::<f64>(&mut self.offset, scroll::BE)
            .map_err(amf_err)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DemuxError> {
        let end = self.offset.checked_add(len).ok_or_else(|| amf_err("length overflow"))?;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| amf_err(format!("string of {} bytes exceeds body", len)))?;
        self.offset = end;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String, DemuxError> {
        let len = self.read_u16()? as usize;
        Ok(String::from_utf8_lossy(self.read_bytes(len)?).into_owned())
    }

    fn read_long_string(&mut self) -> Result<String, DemuxError> {
        let len = self.read_u32()? as usize;
        Ok(String::from_utf8_lossy(self.read_bytes(len)?).into_owned())
    }

    fn read_properties(&mut self, depth: usize) -> Result<Vec<(String, AmfValue)>, DemuxError> {
        let mut props = Vec::new();
        loop {
            // some encoders omit the end marker at the end of the body
            if self.offset >= self.data.len() {
                return Ok(props);
            }
            let key = self.read_string()?;
            if key.is_empty() {
                let marker = self.read_u8()?;
                if marker == MARKER_OBJECT_END {
                    return Ok(props);
                }
                return Err(amf_err(format!("unexpected marker {} after empty key", marker)));
            }
            let value = self.read_value(depth + 1)?;
            props.push((key, value));
        }
    }

    fn read_value(&mut self, depth: usize) -> Result<AmfValue, DemuxError> {
        if depth > MAX_DEPTH {
            return Err(amf_err("nesting too deep"));
        }
        let marker = self.read_u8()?;
        match marker {
            MARKER_NUMBER => Ok(AmfValue::Number(self.read_f64()?)),
            MARKER_BOOLEAN => Ok(AmfValue::Boolean(self.read_u8()? != 0)),
            MARKER_STRING => Ok(AmfValue::String(self.read_string()?)),
            MARKER_OBJECT => Ok(AmfValue::Object(self.read_properties(depth)?)),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_ECMA_ARRAY => {
                // the count is only a hint, properties end with the object-end marker
                let _count = self.read_u32()?;
                Ok(AmfValue::EcmaArray(self.read_properties(depth)?))
            }
            MARKER_STRICT_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Ok(AmfValue::StrictArray(items))
            }
            MARKER_DATE => {
                let millis = self.read_f64()?;
                let _timezone = self.read_u16()?;
                Ok(AmfValue::Date(millis))
            }
            MARKER_LONG_STRING => Ok(AmfValue::String(self.read_long_string()?)),
            other => Err(amf_err(format!("unsupported marker {}", other))),
        }
    }
}

/// Decode a script tag body into its name and first argument.
pub fn decode_script(body: &[u8]) -> Result<(String, AmfValue), DemuxError> {
    let mut decoder = Decoder::new(body);
    let name = match decoder.read_value(0)? {
        AmfValue::String(name) => name,
        other => return Err(amf_err(format!("script name is not a string: {:?}", other))),
    };
    let value = if decoder.offset < body.len() {
        decoder.read_value(0)?
    } else {
        AmfValue::Undefined
    };
    Ok((name, value))
}

/// Seek table from `onMetaData.keyframes`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Keyframes {
    /// Byte offsets of keyframe tags from the start of the file
    pub filepositions: Vec<u64>,
    /// Presentation times in seconds
    pub times: Vec<f64>,
}

impl Keyframes {
    pub fn len(&self) -> usize {
        self.filepositions.len().min(self.times.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.filepositions
            .iter()
            .copied()
            .zip(self.times.iter().copied())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub duration: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub framerate: Option<f64>,
    pub audio_sample_rate: Option<f64>,
    pub keyframes: Option<Keyframes>,
}

impl Metadata {
    /// Extract metadata from a script tag body, `None` if it is not `onMetaData`.
    pub fn from_script(body: &[u8]) -> Result<Option<Self>, DemuxError> {
        let (name, value) = decode_script(body)?;
        if name != "onMetaData" {
            return Ok(None);
        }
        Ok(Some(Self::from_value(&value)))
    }

    pub fn from_value(value: &AmfValue) -> Self {
        let number = |key: &str| {
            value
                .get(key)
                .and_then(AmfValue::as_f64)
                .filter(|v| v.is_finite() && *v > 0.0)
        };
        let keyframes = value.get("keyframes").and_then(|kf| {
            let positions = kf.get("filepositions")?.numbers();
            let times = kf.get("times")?.numbers();
            let keyframes = Keyframes {
                filepositions: positions
                    .into_iter()
                    .map(|p| if p.is_finite() && p > 0.0 { p as u64 } else { 0 })
                    .collect(),
                times: times
                    .into_iter()
                    .map(|t| if t.is_finite() && t > 0.0 { t } else { 0.0 })
                    .collect(),
            };
            (!keyframes.is_empty()).then_some(keyframes)
        });

        Self {
            duration: number("duration"),
            width: number("width"),
            height: number("height"),
            framerate: number("framerate").or_else(|| number("videoframerate")),
            audio_sample_rate: number("audiosamplerate"),
            keyframes,
        }
    }

    pub fn to_value(&self) -> AmfValue {
        let mut props = Vec::new();
        let fields = [
            ("duration", self.duration),
            ("width", self.width),
            ("height", self.height),
            ("framerate", self.framerate),
            ("audiosamplerate", self.audio_sample_rate),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                props.push((key.to_string(), AmfValue::Number(v)));
            }
        }
        if let Some(keyframes) = &self.keyframes {
            props.push((
                "keyframes".to_string(),
                AmfValue::Object(vec![
                    (
                        "filepositions".to_string(),
                        AmfValue::StrictArray(
                            keyframes
                                .filepositions
                                .iter()
                                .map(|p| AmfValue::Number(*p as f64))
                                .collect(),
                        ),
                    ),
                    (
                        "times".to_string(),
                        AmfValue::StrictArray(
                            keyframes.times.iter().map(|t| AmfValue::Number(*t)).collect(),
                        ),
                    ),
                ]),
            ));
        }
        AmfValue::EcmaArray(props)
    }
}
