use std::path::Path;

use reck_common::{
    anyhow::Result,
    image::ImageReader,
    maps::MemoryRegion,
    proto::{BlockEntry, BlockKind},
    serde_json,
    tracing::Console,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Block {
    #[serde(flatten)]
    entry: BlockEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<MemoryRegion>,
}

/// Lines describing the checkpoint at `path`.
pub fn render(path: &Path, regions: bool, json: bool) -> Result<Vec<String>> {
    let mut image = ImageReader::open(path)?;

    let mut blocks = vec![];
    for entry in image.index()? {
        let region = match entry.kind {
            BlockKind::MemoryMap | BlockKind::VdsoMap if regions => Some(image.read_region(&entry)?.0),
            _ => None,
        };
        blocks.push(Block { entry, region });
    }

    if json {
        return Ok(vec![serde_json::to_string_pretty(&blocks)?]);
    }

    let mut lines = vec![];
    for block in blocks {
        lines.push(block.entry.to_string());
        if let Some(region) = block.region {
            lines.push(format!("    {region}"));
        }
    }
    Ok(lines)
}

pub fn inspect(console: &Console, path: &Path, regions: bool, json: bool) -> Result<()> {
    for line in render(path, regions, json)? {
        console.println(line);
    }
    Ok(())
}
