//! Per-service protocol registry: maps both a string name and a numeric
//! `PTYPE` to the record describing how payloads of that type are packed,
//! unpacked, and whether inbound requests are dispatchable at all.

use std::collections::HashMap;

use skep_protocol::{Buffer, Value, ptype};

pub type PackFn = fn(&Value) -> Result<Buffer, skep_protocol::Error>;
pub type UnpackFn = fn(&[u8]) -> Result<Value, skep_protocol::Error>;

#[derive(Clone)]
pub struct ProtoRecord {
    pub name: &'static str,
    pub ptype: u8,
    pub pack: Option<PackFn>,
    pub unpack: Option<UnpackFn>,
    /// Whether inbound requests of this type reach the service's dispatch
    /// callback. Reply-only protocols leave this off.
    pub dispatch: bool,
}

fn pack_value(value: &Value) -> Result<Buffer, skep_protocol::Error> {
    value.pack()
}

fn unpack_value(bytes: &[u8]) -> Result<Value, skep_protocol::Error> {
    Value::unpack(bytes)
}

pub struct ProtocolRegistry {
    by_ptype: HashMap<u8, ProtoRecord>,
    by_name: HashMap<&'static str, u8>,
}

impl ProtocolRegistry {
    /// A registry pre-populated with the reserved protocol types.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            by_ptype: HashMap::new(),
            by_name: HashMap::new(),
        };

        let defaults = [
            ProtoRecord { name: "system", ptype: ptype::SYSTEM, pack: None, unpack: None, dispatch: true },
            ProtoRecord { name: "text", ptype: ptype::TEXT, pack: None, unpack: None, dispatch: true },
            ProtoRecord {
                name: "lua",
                ptype: ptype::LUA,
                pack: Some(pack_value),
                unpack: Some(unpack_value),
                dispatch: true,
            },
            ProtoRecord { name: "socket", ptype: ptype::SOCKET, pack: None, unpack: None, dispatch: true },
            ProtoRecord { name: "error", ptype: ptype::ERROR, pack: None, unpack: None, dispatch: true },
            ProtoRecord { name: "websocket", ptype: ptype::WS, pack: None, unpack: None, dispatch: true },
            ProtoRecord { name: "debug", ptype: ptype::DEBUG, pack: None, unpack: None, dispatch: true },
        ];
        for record in defaults {
            registry.register(record);
        }
        registry
    }

    /// Register or replace a protocol record.
    pub fn register(&mut self, record: ProtoRecord) {
        self.by_name.insert(record.name, record.ptype);
        self.by_ptype.insert(record.ptype, record);
    }

    pub fn resolve(&self, ptype: u8) -> Option<&ProtoRecord> {
        self.by_ptype.get(&ptype)
    }

    pub fn resolve_name(&self, name: &str) -> Option<&ProtoRecord> {
        self.by_name.get(name).and_then(|p| self.by_ptype.get(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_reserved_types() {
        let registry = ProtocolRegistry::with_defaults();
        for p in [
            ptype::SYSTEM,
            ptype::TEXT,
            ptype::LUA,
            ptype::SOCKET,
            ptype::ERROR,
            ptype::WS,
            ptype::DEBUG,
        ] {
            assert!(registry.resolve(p).is_some(), "missing default ptype {p}");
        }
        assert_eq!(registry.resolve_name("lua").unwrap().ptype, ptype::LUA);
        assert!(registry.resolve(200).is_none());
    }

    #[test]
    fn lua_record_round_trips_values() {
        let registry = ProtocolRegistry::with_defaults();
        let record = registry.resolve(ptype::LUA).unwrap();

        let value = Value::Array(vec![Value::Int(1), Value::Str("two".into())]);
        let packed = (record.pack.unwrap())(&value).unwrap();
        let unpacked = (record.unpack.unwrap())(packed.as_slice()).unwrap();
        assert_eq!(unpacked, value);
    }

    #[test]
    fn registration_replaces_and_disables_dispatch() {
        let mut registry = ProtocolRegistry::with_defaults();
        registry.register(ProtoRecord {
            name: "client",
            ptype: 42,
            pack: Some(pack_value),
            unpack: Some(unpack_value),
            dispatch: false,
        });

        let record = registry.resolve(42).unwrap();
        assert!(!record.dispatch);
        assert_eq!(registry.resolve_name("client").unwrap().ptype, 42);
    }
}
