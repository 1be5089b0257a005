//! Offline firmware image inspection.

use anyhow::Result;
use console::style;
use defyflash::{CHUNK_SIZE, FirmwareImage};
use serde_json::{Value, json};
use std::path::Path;

use super::hex32;
use crate::commands::upgrade::load_image;

/// Print the seal and transfer layout of a firmware image.
pub(crate) fn cmd_inspect(firmware: &Path, json_output: bool) -> Result<()> {
    let image = load_image(firmware)?;

    if json_output {
        let payload = json!({
            "ok": true,
            "data": image_json(firmware, &image),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let seal = image.seal();
    eprintln!(
        "{} {}",
        style("Firmware:").bold(),
        style(firmware.display()).cyan()
    );
    eprintln!("  Size:            {} bytes", image.len());
    eprintln!(
        "  Blocks:          {} x {} bytes",
        image.chunk_count(),
        CHUNK_SIZE
    );
    eprintln!("  Image CRC-32:    {}", hex32(image.crc32()));
    eprintln!("\n{}", style("Seal").bold());
    eprintln!("  Device ID:       {}", hex32(seal.header.device_id));
    eprintln!("  Seal version:    {}", hex32(seal.header.version));
    eprintln!("  Sealed size:     {}", seal.header.size);
    eprintln!("  Seal CRC:        {}", hex32(seal.header.crc));
    eprintln!("  Program start:   {}", hex32(seal.program_start));
    eprintln!("  Program size:    {}", seal.program_size);
    eprintln!("  Program CRC:     {}", hex32(seal.program_crc));
    eprintln!("  Program version: {}", hex32(seal.program_version));

    Ok(())
}

fn image_json(path: &Path, image: &FirmwareImage) -> Value {
    let seal = image.seal();
    json!({
        "path": path.display().to_string(),
        "size": image.len(),
        "blocks": image.chunk_count(),
        "crc32": hex32(image.crc32()),
        "seal": {
            "device_id": hex32(seal.header.device_id),
            "version": hex32(seal.header.version),
            "size": seal.header.size,
            "crc": hex32(seal.header.crc),
            "program_start": hex32(seal.program_start),
            "program_size": seal.program_size,
            "program_crc": hex32(seal.program_crc),
            "program_version": hex32(seal.program_version),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_json_layout() {
        let mut data = vec![0u8; 600];
        data[0..4].copy_from_slice(&0x0000_0044u32.to_le_bytes());
        data[20..24].copy_from_slice(&568u32.to_le_bytes());
        data[24..28].copy_from_slice(&0xCAFE_F00Du32.to_le_bytes());
        let image = FirmwareImage::from_bytes(data).unwrap();

        let value = image_json(Path::new("fw.bin"), &image);
        assert_eq!(value["path"], "fw.bin");
        assert_eq!(value["size"], 600);
        assert_eq!(value["blocks"], 3);
        assert_eq!(value["seal"]["device_id"], "0x00000044");
        assert_eq!(value["seal"]["program_size"], 568);
        assert_eq!(value["seal"]["program_crc"], "0xCAFEF00D");
    }

    #[test]
    fn test_inspect_rejects_truncated_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        assert!(cmd_inspect(&path, true).is_err());
    }
}
