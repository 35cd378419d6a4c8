use anyhow::{bail, Context, Error};
use flate2::read::MultiGzDecoder;
use log::info;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for a single download. The published datasets are large.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Last path segment of `url`, without any query string or fragment.
/// Falls back to `default` when the URL ends in a slash.
pub fn file_name_from_url<'a>(url: &'a str, default: &'a str) -> &'a str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or(default)
}

fn client(timeout: Duration) -> Result<reqwest::blocking::Client, Error> {
    Ok(reqwest::blocking::Client::builder().timeout(timeout).build()?)
}

/// Stream `url` into `dest`. The body is written to `dest.part` and renamed
/// on success, so an interrupted download never looks complete.
fn download(url: &str, dest: &Path, timeout: Duration) -> Result<(), Error> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| parent.display().to_string())?;
    }
    let part = dest.with_extension(
        dest.extension()
            .map_or_else(|| "part".to_string(), |e| format!("{}.part", e.to_string_lossy())),
    );

    info!("downloading {} to {}", url, dest.display());
    let mut response = client(timeout)?
        .get(url)
        .send()
        .with_context(|| format!("requesting {url}"))?;
    if !response.status().is_success() {
        bail!("failed to download {}: HTTP {}", url, response.status());
    }

    let mut out = BufWriter::new(File::create(&part).with_context(|| part.display().to_string())?);
    let bytes = io::copy(&mut response, &mut out).with_context(|| format!("reading body of {url}"))?;
    out.flush()?;
    drop(out);
    fs::rename(&part, dest).with_context(|| dest.display().to_string())?;
    info!("downloaded {} bytes", bytes);
    Ok(())
}

/// Download a single file unless `dest` already exists. Returns `dest`.
pub fn fetch_file(url: &str, dest: impl AsRef<Path>, timeout: Duration) -> Result<PathBuf, Error> {
    let dest = dest.as_ref();
    if dest.is_file() {
        info!("{} already present, skipping download", dest.display());
    } else {
        download(url, dest, timeout)?;
    }
    Ok(dest.to_path_buf())
}

/// Unpack a gzipped tarball into `dest_dir`.
pub fn unpack_tar_gz(archive: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<(), Error> {
    let archive = archive.as_ref();
    let dest_dir = dest_dir.as_ref();
    let file = File::open(archive).with_context(|| archive.display().to_string())?;
    let mut tar = tar::Archive::new(MultiGzDecoder::new(BufReader::new(file)));
    tar.unpack(dest_dir)
        .with_context(|| format!("unpacking {} into {}", archive.display(), dest_dir.display()))?;
    Ok(())
}

/// Download and unpack a `.tar.gz` archive into `dest_dir`. If `marker` (a path
/// relative to `dest_dir`) already exists the archive is assumed to be unpacked
/// and nothing is fetched. Returns the marker path.
pub fn fetch_archive(
    url: &str,
    dest_dir: impl AsRef<Path>,
    marker: impl AsRef<Path>,
    timeout: Duration,
) -> Result<PathBuf, Error> {
    let dest_dir = dest_dir.as_ref();
    let marker = dest_dir.join(marker);
    if marker.exists() {
        info!("{} already present, skipping download", marker.display());
        return Ok(marker);
    }

    let archive = dest_dir.join(file_name_from_url(url, "archive.tar.gz"));
    fetch_file(url, &archive, timeout)?;
    unpack_tar_gz(&archive, dest_dir)?;
    if !marker.exists() {
        bail!("{} did not contain {}", archive.display(), marker.display());
    }
    Ok(marker)
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn test_unpack_tar_gz() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("quant.tar.gz");
        {
            let enc = GzEncoder::new(File::create(&archive)?, Compression::default());
            let mut builder = tar::Builder::new(enc);
            let body = b"AAACCTG-1\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "quant/barcodes.tsv", &body[..])?;
            builder.into_inner()?.finish()?;
        }
        let out = dir.path().join("out");
        unpack_tar_gz(&archive, &out)?;
        assert_eq!(fs::read_to_string(out.join("quant/barcodes.tsv"))?, "AAACCTG-1\n");
        Ok(())
    }

    #[test]
    fn test_file_name_from_url() {
        fn f(url: &str) -> &str {
            file_name_from_url(url, "default.gtf")
        }
        assert_eq!(f("https://host/data/genes.gtf.gz"), "genes.gtf.gz");
        assert_eq!(f("https://host/data/pbmc.tar.gz?download=1"), "pbmc.tar.gz");
        assert_eq!(f("https://host/genes.gtf#section"), "genes.gtf");
        assert_eq!(f("https://host/files/?id=3"), "default.gtf");
        assert_eq!(f("https://host/dir/"), "default.gtf");
    }

    #[test]
    fn test_existing_marker_skips_download() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("pbmc"))?;
        // an unroutable url would fail if it were requested
        let m = fetch_archive("http://invalid.invalid/pbmc.tar.gz", dir.path(), "pbmc", DEFAULT_TIMEOUT)?;
        assert_eq!(m, dir.path().join("pbmc"));
        Ok(())
    }
}
