use anyhow::Result;
use pq_explorer::{BatchResult, serialize_batch_result_pretty};
use std::io::Write;

pub fn write_json_batch<W: Write>(w: &mut W, batch: &BatchResult) -> Result<()> {
    let text = serialize_batch_result_pretty(batch)?;
    w.write_all(text.as_bytes())?;
    writeln!(w)?;
    Ok(())
}
