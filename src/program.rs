use crate::opcodes::{Instr, Opcode, Operand};
use crate::store::{Kind, ValueType};
use chrono::TimeDelta;
use regex::Regex;
use std::fmt::Write as _;

/// Wire form of a compiled [`Object`]
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Object {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub program: ::prost::alloc::vec::Vec<Instr>,
        #[prost(string, repeated, tag = "3")]
        pub strings: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(string, repeated, tag = "4")]
        pub regexps: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(message, repeated, tag = "5")]
        pub metrics: ::prost::alloc::vec::Vec<MetricDesc>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Instr {
        #[prost(uint32, tag = "1")]
        pub opcode: u32,
        #[prost(uint32, tag = "2")]
        pub source_line: u32,
        #[prost(oneof = "instr::Operand", tags = "3, 4, 5, 6, 7, 8")]
        pub operand: ::core::option::Option<instr::Operand>,
    }

    pub mod instr {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Operand {
            #[prost(int64, tag = "3")]
            Int(i64),
            #[prost(double, tag = "4")]
            Float(f64),
            #[prost(bool, tag = "5")]
            Bool(bool),
            #[prost(uint64, tag = "6")]
            Str(u64),
            #[prost(uint64, tag = "7")]
            Regex(u64),
            #[prost(message, tag = "8")]
            Duration(::prost_types::Duration),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricDesc {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub exported_name: ::prost::alloc::string::String,
        #[prost(uint32, tag = "3")]
        pub kind: u32,
        #[prost(uint32, tag = "4")]
        pub value_type: u32,
        #[prost(string, repeated, tag = "5")]
        pub keys: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(double, repeated, tag = "6")]
        pub buckets: ::prost::alloc::vec::Vec<f64>,
        #[prost(uint64, tag = "7")]
        pub limit: u64,
        #[prost(bool, tag = "8")]
        pub hidden: bool,
    }
}

/// A metric declared by a program
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDesc {
    /// Name used inside the program
    pub name: String,
    /// Name the metric is registered and exported under
    pub exported_name: String,
    pub kind: Kind,
    pub value_type: ValueType,
    pub keys: Vec<String>,
    pub buckets: Vec<f64>,
    pub limit: Option<usize>,
    pub hidden: bool,
}

/// A compiled program ready for execution
///
/// Immutable once produced; shared read-only by every [`crate::executor::Executor`]
/// running it.
#[derive(Debug, Clone)]
pub struct Object {
    /// Program name (base name of the source file)
    pub name: String,
    pub program: Vec<Instr>,
    pub strings: Vec<String>,
    pub regexps: Vec<Regex>,
    pub metrics: Vec<MetricDesc>,
}

fn kind_to_proto(kind: Kind) -> u32 {
    match kind {
        Kind::Counter => 0,
        Kind::Gauge => 1,
        Kind::Timer => 2,
        Kind::Text => 3,
        Kind::Histogram => 4,
    }
}

fn kind_from_proto(value: u32) -> Result<Kind, String> {
    Ok(match value {
        0 => Kind::Counter,
        1 => Kind::Gauge,
        2 => Kind::Timer,
        3 => Kind::Text,
        4 => Kind::Histogram,
        _ => return Err(format!("Invalid metric kind: {}", value)),
    })
}

fn value_type_to_proto(value_type: ValueType) -> u32 {
    match value_type {
        ValueType::Int => 0,
        ValueType::Float => 1,
        ValueType::String => 2,
        ValueType::Buckets => 3,
    }
}

fn value_type_from_proto(value: u32) -> Result<ValueType, String> {
    Ok(match value {
        0 => ValueType::Int,
        1 => ValueType::Float,
        2 => ValueType::String,
        3 => ValueType::Buckets,
        _ => return Err(format!("Invalid value type: {}", value)),
    })
}

impl Object {
    /// Deserialize an Object from protobuf bytes
    pub fn from_proto_bytes(bytes: &[u8]) -> Result<Self, String> {
        use prost::Message;

        let proto_object = proto::Object::decode(bytes)
            .map_err(|e| format!("Failed to decode protobuf: {}", e))?;

        Self::from_proto(proto_object)
    }

    /// Convert from protobuf Object message
    pub fn from_proto(proto: proto::Object) -> Result<Self, String> {
        let program = proto
            .program
            .into_iter()
            .map(Self::convert_instr)
            .collect::<Result<Vec<_>, _>>()?;
        let regexps = proto
            .regexps
            .iter()
            .map(|src| Regex::new(src).map_err(|e| format!("Invalid regexp {:?}: {}", src, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let metrics = proto
            .metrics
            .into_iter()
            .map(MetricDesc::from_proto)
            .collect::<Result<Vec<_>, _>>()?;

        let object = Object {
            name: proto.name,
            program,
            strings: proto.strings,
            regexps,
            metrics,
        };
        object.validate()?;
        Ok(object)
    }

    /// Serialize this Object to protobuf bytes
    pub fn to_proto_bytes(&self) -> Vec<u8> {
        use prost::Message;

        self.to_proto().encode_to_vec()
    }

    /// Convert to protobuf Object message
    pub fn to_proto(&self) -> proto::Object {
        proto::Object {
            name: self.name.clone(),
            program: self.program.iter().map(Self::convert_instr_to_proto).collect(),
            strings: self.strings.clone(),
            regexps: self.regexps.iter().map(|re| re.as_str().to_string()).collect(),
            metrics: self.metrics.iter().map(MetricDesc::to_proto).collect(),
        }
    }

    /// Check that every operand index and jump target is in range
    pub fn validate(&self) -> Result<(), String> {
        let len = self.program.len() as i64;
        for (pc, instr) in self.program.iter().enumerate() {
            let ok = match (instr.opcode, instr.operand) {
                (Opcode::Jmp | Opcode::Jm | Opcode::Jnm, Operand::Int(target)) => {
                    (0..=len).contains(&target)
                }
                (Opcode::Jmp | Opcode::Jm | Opcode::Jnm, _) => false,
                (_, Operand::Str(i)) => i < self.strings.len(),
                (_, Operand::Regex(i)) => i < self.regexps.len(),
                (Opcode::Mload, Operand::Int(i)) => (i as usize) < self.metrics.len() && i >= 0,
                _ => true,
            };
            if !ok {
                return Err(format!("Invalid operand at pc {}: {}", pc, instr));
            }
        }
        Ok(())
    }

    /// Human readable listing of the program and its tables
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "program {}", self.name);
        for (i, m) in self.metrics.iter().enumerate() {
            let _ = writeln!(
                out,
                "  metric {} {} {} {:?} ({})",
                i, m.kind, m.exported_name, m.keys, m.value_type
            );
        }
        for (i, s) in self.strings.iter().enumerate() {
            let _ = writeln!(out, "  str#{} {:?}", i, s);
        }
        for (i, re) in self.regexps.iter().enumerate() {
            let _ = writeln!(out, "  re#{} /{}/", i, re.as_str());
        }
        for (pc, instr) in self.program.iter().enumerate() {
            let _ = writeln!(out, "{:4} {:<24} ; line {}", pc, instr.to_string(), instr.source_line + 1);
        }
        out
    }

    fn convert_instr(proto: proto::Instr) -> Result<Instr, String> {
        use proto::instr::Operand as PO;

        let byte = u8::try_from(proto.opcode)
            .map_err(|_| format!("Invalid opcode: {}", proto.opcode))?;
        let opcode = Opcode::from_u8(byte)?;
        let operand = match proto.operand {
            None => Operand::None,
            Some(PO::Int(n)) => Operand::Int(n),
            Some(PO::Float(f)) => Operand::Float(f),
            Some(PO::Bool(b)) => Operand::Bool(b),
            Some(PO::Str(i)) => Operand::Str(i as usize),
            Some(PO::Regex(i)) => Operand::Regex(i as usize),
            Some(PO::Duration(d)) => Operand::Duration(
                TimeDelta::new(d.seconds, d.nanos.max(0) as u32)
                    .ok_or_else(|| format!("Invalid duration operand: {:?}", d))?,
            ),
        };
        Ok(Instr::new(opcode, operand, proto.source_line))
    }

    fn convert_instr_to_proto(instr: &Instr) -> proto::Instr {
        use proto::instr::Operand as PO;

        let operand = match instr.operand {
            Operand::None => None,
            Operand::Int(n) => Some(PO::Int(n)),
            Operand::Float(f) => Some(PO::Float(f)),
            Operand::Bool(b) => Some(PO::Bool(b)),
            Operand::Str(i) => Some(PO::Str(i as u64)),
            Operand::Regex(i) => Some(PO::Regex(i as u64)),
            Operand::Duration(d) => Some(PO::Duration(::prost_types::Duration {
                seconds: d.num_seconds(),
                nanos: d.subsec_nanos(),
            })),
        };
        proto::Instr {
            opcode: instr.opcode as u32,
            source_line: instr.source_line,
            operand,
        }
    }
}

impl MetricDesc {
    pub fn from_proto(proto: proto::MetricDesc) -> Result<Self, String> {
        Ok(MetricDesc {
            kind: kind_from_proto(proto.kind)?,
            value_type: value_type_from_proto(proto.value_type)?,
            exported_name: if proto.exported_name.is_empty() {
                proto.name.clone()
            } else {
                proto.exported_name
            },
            name: proto.name,
            keys: proto.keys,
            buckets: proto.buckets,
            limit: (proto.limit > 0).then_some(proto.limit as usize),
            hidden: proto.hidden,
        })
    }

    pub fn to_proto(&self) -> proto::MetricDesc {
        proto::MetricDesc {
            name: self.name.clone(),
            exported_name: self.exported_name.clone(),
            kind: kind_to_proto(self.kind),
            value_type: value_type_to_proto(self.value_type),
            keys: self.keys.clone(),
            buckets: self.buckets.clone(),
            limit: self.limit.unwrap_or(0) as u64,
            hidden: self.hidden,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Object {
        Object {
            name: "test.mtail".to_string(),
            program: vec![
                Instr::new(Opcode::Match, Operand::Regex(0), 1),
                Instr::new(Opcode::Jnm, Operand::Int(6), 1),
                Instr::new(Opcode::Setmatched, Operand::Bool(false), 1),
                Instr::new(Opcode::Push, Operand::Duration(TimeDelta::milliseconds(1500)), 1),
                Instr::new(Opcode::Mload, Operand::Int(0), 1),
                Instr::new(Opcode::Expire, Operand::Int(0), 1),
            ],
            strings: vec!["foo".to_string()],
            regexps: vec![Regex::new("^a(\\d+)$").unwrap()],
            metrics: vec![MetricDesc {
                name: "lines".to_string(),
                exported_name: "lines_total".to_string(),
                kind: Kind::Counter,
                value_type: ValueType::Int,
                keys: vec![],
                buckets: vec![],
                limit: Some(10),
                hidden: false,
            }],
        }
    }

    #[test]
    fn test_object_roundtrip() {
        let object = sample();
        let bytes = object.to_proto_bytes();
        let decoded = Object::from_proto_bytes(&bytes).unwrap();

        assert_eq!(decoded.name, "test.mtail");
        assert_eq!(decoded.program, object.program);
        assert_eq!(decoded.strings, object.strings);
        assert_eq!(decoded.regexps[0].as_str(), "^a(\\d+)$");
        assert_eq!(decoded.metrics, object.metrics);
    }

    #[test]
    fn test_validate_rejects_bad_jump() {
        let mut object = sample();
        object.program[1] = Instr::new(Opcode::Jnm, Operand::Int(99), 1);
        assert!(object.validate().is_err());
        let bytes = object.to_proto_bytes();
        assert!(Object::from_proto_bytes(&bytes).is_err());
    }

    #[test]
    fn test_disassemble_lists_everything() {
        let text = sample().disassemble();
        assert!(text.starts_with("program test.mtail\n"));
        assert!(text.contains("re#0 /^a(\\d+)$/"));
        assert!(text.contains("match re#0"));
        assert!(text.contains("line 2"));
    }
}
