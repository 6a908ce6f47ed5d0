// Maps persisted as a single JSON chunk behind a named head.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tabsync_dag::{Chunk, DagError, Read, Write};

pub(crate) fn read_map<R, K, V>(tx: &R, head: &str) -> Result<BTreeMap<K, V>>
where
    R: Read,
    K: Ord + DeserializeOwned,
    V: DeserializeOwned,
{
    let Some(hash) = tx.get_head(head) else {
        return Ok(BTreeMap::new());
    };
    let chunk = tx.get_chunk(&hash).ok_or(DagError::NotFound(hash))?;
    Ok(chunk.decode()?)
}

pub(crate) fn write_map<W, K, V>(tx: &mut W, head: &str, map: &BTreeMap<K, V>) -> Result<()>
where
    W: Write,
    K: Ord + Serialize,
    V: Serialize,
{
    let chunk = Chunk::from_json(map)?;
    let hash = chunk.hash();
    tx.put_chunk(chunk);
    tx.set_head(head, hash);
    Ok(())
}
