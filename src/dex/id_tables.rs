//! The five ID tables of a DEX file, resolved into pool refs.

use rayon::prelude::*;

use crate::dex::error::DexError;
use crate::dex::header::DexHeader;
use crate::dex::{read_u2, read_u4, read_uleb128, NO_INDEX};
use crate::model::pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType, DexTypeList};

/// Maps on-disk indices to pool refs while decoding.
pub trait IndexResolver: Sync {
    fn string(&self, idx: u32) -> Result<DexString, DexError>;
    fn type_at(&self, idx: u32) -> Result<DexType, DexError>;
    fn proto(&self, idx: u32) -> Result<DexProto, DexError>;
    fn field(&self, idx: u32) -> Result<DexFieldRef, DexError>;
    fn method(&self, idx: u32) -> Result<DexMethodRef, DexError>;
}

/// Maps pool refs to the indices assigned by an encoder.
pub trait IndexAssigner {
    fn string_idx(&self, s: DexString) -> Result<u32, DexError>;
    fn type_idx(&self, t: DexType) -> Result<u32, DexError>;
    fn proto_idx(&self, p: DexProto) -> Result<u32, DexError>;
    fn field_idx(&self, f: DexFieldRef) -> Result<u32, DexError>;
    fn method_idx(&self, m: DexMethodRef) -> Result<u32, DexError>;
}

/// Visitor used to gather every ref an entity mentions before encoding.
pub trait RefCollector {
    fn string(&mut self, s: DexString);
    fn type_ref(&mut self, t: DexType);
    fn proto(&mut self, p: DexProto);
    fn field(&mut self, f: DexFieldRef);
    fn method(&mut self, m: DexMethodRef);
}

pub(crate) struct IdTables {
    strings: Vec<DexString>,
    types: Vec<DexType>,
    protos: Vec<DexProto>,
    fields: Vec<DexFieldRef>,
    methods: Vec<DexMethodRef>,
}

fn lookup<T: Copy>(table: &[T], idx: u32, what: &str) -> Result<T, DexError> {
    match table.get(idx as usize) {
        Some(v) => Ok(*v),
        None => fail!("{} index {} out of range (table size {})", what, idx, table.len()),
    }
}

pub(crate) fn read_type_list(bytes: &[u8], off: u32, types: &[DexType]) -> Result<DexTypeList, DexError> {
    if off == 0 {
        return Ok(DexTypeList::empty());
    }
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    let mut list = Vec::with_capacity(size.min(0x1_0000) as usize);
    for _ in 0..size {
        list.push(lookup(types, read_u2(bytes, &mut ix)? as u32, "type")?);
    }
    Ok(DexTypeList::make(list))
}

impl IdTables {
    pub(crate) fn read(bytes: &[u8], header: &DexHeader) -> Result<IdTables, DexError> {
        let strings = (0..header.string_ids.size)
            .into_par_iter()
            .map(|i| {
                let mut ix = (header.string_ids.off + i * 4) as usize;
                let data_off = read_u4(bytes, &mut ix)? as usize;
                let mut cursor = data_off;
                let utf16_size = read_uleb128(bytes, &mut cursor)?;
                let tail = bytes.get(cursor..).unwrap_or(&[]);
                let Some(len) = tail.iter().position(|b| *b == 0) else {
                    fail!("Unterminated string_data_item at 0x{:x}", data_off);
                };
                let s = DexString::make_from_mutf8(&tail[..len]);
                if s.utf16_size() != utf16_size {
                    log::warn!(
                        "[strings] string #{} declares utf16_size {} but decodes to {}",
                        i,
                        utf16_size,
                        s.utf16_size()
                    );
                }
                Ok(s)
            })
            .collect::<Result<Vec<_>, DexError>>()?;

        let mut types = Vec::with_capacity(header.type_ids.size as usize);
        let mut ix = header.type_ids.off as usize;
        for _ in 0..header.type_ids.size {
            types.push(DexType::make_from(lookup(&strings, read_u4(bytes, &mut ix)?, "string")?));
        }

        let mut protos = Vec::with_capacity(header.proto_ids.size as usize);
        let mut ix = header.proto_ids.off as usize;
        for i in 0..header.proto_ids.size {
            let shorty = lookup(&strings, read_u4(bytes, &mut ix)?, "string")?;
            let rtype = lookup(&types, read_u4(bytes, &mut ix)?, "type")?;
            let params = read_type_list(bytes, read_u4(bytes, &mut ix)?, &types)?;
            let proto = DexProto::make(rtype, params);
            if proto.shorty() != shorty {
                fail!("proto #{} shorty {} does not match its signature {}", i, shorty, proto);
            }
            protos.push(proto);
        }

        let mut fields = Vec::with_capacity(header.field_ids.size as usize);
        let mut ix = header.field_ids.off as usize;
        for _ in 0..header.field_ids.size {
            let class = lookup(&types, read_u2(bytes, &mut ix)? as u32, "type")?;
            let ty = lookup(&types, read_u2(bytes, &mut ix)? as u32, "type")?;
            let name = lookup(&strings, read_u4(bytes, &mut ix)?, "string")?;
            fields.push(DexFieldRef::make(class, name, ty));
        }

        let mut methods = Vec::with_capacity(header.method_ids.size as usize);
        let mut ix = header.method_ids.off as usize;
        for _ in 0..header.method_ids.size {
            let class = lookup(&types, read_u2(bytes, &mut ix)? as u32, "type")?;
            let proto = lookup(&protos, read_u2(bytes, &mut ix)? as u32, "proto")?;
            let name = lookup(&strings, read_u4(bytes, &mut ix)?, "string")?;
            methods.push(DexMethodRef::make(class, name, proto));
        }

        Ok(IdTables { strings, types, protos, fields, methods })
    }

    pub(crate) fn types(&self) -> &[DexType] {
        &self.types
    }

    pub(crate) fn optional_type(&self, idx: u32) -> Result<Option<DexType>, DexError> {
        if idx == NO_INDEX {
            Ok(None)
        } else {
            self.type_at(idx).map(Some)
        }
    }

    pub(crate) fn optional_string(&self, idx: u32) -> Result<Option<DexString>, DexError> {
        if idx == NO_INDEX {
            Ok(None)
        } else {
            self.string(idx).map(Some)
        }
    }

    pub(crate) fn counts(&self) -> (usize, usize, usize, usize, usize) {
        (self.strings.len(), self.types.len(), self.protos.len(), self.fields.len(), self.methods.len())
    }
}

impl IndexResolver for IdTables {
    fn string(&self, idx: u32) -> Result<DexString, DexError> {
        lookup(&self.strings, idx, "string")
    }

    fn type_at(&self, idx: u32) -> Result<DexType, DexError> {
        lookup(&self.types, idx, "type")
    }

    fn proto(&self, idx: u32) -> Result<DexProto, DexError> {
        lookup(&self.protos, idx, "proto")
    }

    fn field(&self, idx: u32) -> Result<DexFieldRef, DexError> {
        lookup(&self.fields, idx, "field")
    }

    fn method(&self, idx: u32) -> Result<DexMethodRef, DexError> {
        lookup(&self.methods, idx, "method")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Hands out indices in first-seen order and resolves them back.
    #[derive(Default)]
    pub(crate) struct FixedIds {
        strings: Mutex<Vec<DexString>>,
        types: Mutex<Vec<DexType>>,
        protos: Mutex<Vec<DexProto>>,
        fields: Mutex<Vec<DexFieldRef>>,
        methods: Mutex<Vec<DexMethodRef>>,
    }

    fn assign<T: PartialEq + Copy>(table: &Mutex<Vec<T>>, v: T) -> u32 {
        let mut t = table.lock().unwrap();
        match t.iter().position(|x| *x == v) {
            Some(i) => i as u32,
            None => {
                t.push(v);
                (t.len() - 1) as u32
            }
        }
    }

    fn resolve<T: Copy>(table: &Mutex<Vec<T>>, idx: u32) -> Result<T, DexError> {
        lookup(&table.lock().unwrap(), idx, "fixed")
    }

    impl IndexAssigner for FixedIds {
        fn string_idx(&self, s: DexString) -> Result<u32, DexError> {
            Ok(assign(&self.strings, s))
        }
        fn type_idx(&self, t: DexType) -> Result<u32, DexError> {
            Ok(assign(&self.types, t))
        }
        fn proto_idx(&self, p: DexProto) -> Result<u32, DexError> {
            Ok(assign(&self.protos, p))
        }
        fn field_idx(&self, f: DexFieldRef) -> Result<u32, DexError> {
            Ok(assign(&self.fields, f))
        }
        fn method_idx(&self, m: DexMethodRef) -> Result<u32, DexError> {
            Ok(assign(&self.methods, m))
        }
    }

    impl IndexResolver for FixedIds {
        fn string(&self, idx: u32) -> Result<DexString, DexError> {
            resolve(&self.strings, idx)
        }
        fn type_at(&self, idx: u32) -> Result<DexType, DexError> {
            resolve(&self.types, idx)
        }
        fn proto(&self, idx: u32) -> Result<DexProto, DexError> {
            resolve(&self.protos, idx)
        }
        fn field(&self, idx: u32) -> Result<DexFieldRef, DexError> {
            resolve(&self.fields, idx)
        }
        fn method(&self, idx: u32) -> Result<DexMethodRef, DexError> {
            resolve(&self.methods, idx)
        }
    }
}
