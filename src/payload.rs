use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::{CompressionMethod, ZipArchive};

use crate::error::{Result, UpdaterError};

pub const PAYLOAD_BIN: &str = "payload.bin";
pub const PAYLOAD_PROPERTIES: &str = "payload_properties.txt";

/// Where the engine finds the payload inside the package, and the headers it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSpec {
    pub offset: u64,
    pub size: u64,
    pub headers: Vec<String>,
}

/// Reads the package's central directory. The payload entry must be stored
/// uncompressed since the engine streams it straight from `offset`.
pub fn prepare(package: &Path) -> Result<PayloadSpec> {
    let file = File::open(package)
        .map_err(|e| UpdaterError::InstallPrepare(format!("{:?}: {}", package, e)))?;
    let mut archive = ZipArchive::new(file)?;

    let (offset, size) = {
        let entry = archive.by_name(PAYLOAD_BIN)?;
        if entry.compression() != CompressionMethod::Stored {
            return Err(UpdaterError::InstallPrepare(format!(
                "{} is compressed ({:?})",
                PAYLOAD_BIN,
                entry.compression()
            )));
        }
        (entry.data_start(), entry.size())
    };

    let mut properties = String::new();
    archive
        .by_name(PAYLOAD_PROPERTIES)?
        .read_to_string(&mut properties)
        .map_err(|e| UpdaterError::InstallPrepare(format!("{}: {}", PAYLOAD_PROPERTIES, e)))?;

    Ok(PayloadSpec {
        offset,
        size,
        headers: parse_properties(&properties)?,
    })
}

fn parse_properties(text: &str) -> Result<Vec<String>> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('=') {
            Some((key, _)) if !key.is_empty() => Ok(line.to_string()),
            _ => Err(UpdaterError::InstallPrepare(format!(
                "malformed property line {:?}",
                line
            ))),
        })
        .collect()
}

#[cfg(test)]
pub(crate) const TEST_PROPERTIES: &str = "FILE_HASH=aGFzaA==\nFILE_SIZE=4096\nMETADATA_HASH=bWV0YQ==\nMETADATA_SIZE=512\n";

/// Writes a minimal OTA package: properties first, then the stored payload.
#[cfg(test)]
pub(crate) fn write_package(path: &Path, payload: &[u8], properties: &str, method: CompressionMethod) {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let stored = || SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("META-INF/com/android/metadata", stored()).unwrap();
    zip.write_all(b"ota-type=AB\n").unwrap();
    zip.start_file(PAYLOAD_PROPERTIES, stored()).unwrap();
    zip.write_all(properties.as_bytes()).unwrap();
    zip.start_file(PAYLOAD_BIN, SimpleFileOptions::default().compression_method(method))
        .unwrap();
    zip.write_all(payload).unwrap();
    zip.finish().unwrap();
}
