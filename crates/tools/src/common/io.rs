//! ファイル入力ユーティリティ（gzip対応）

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB

fn is_gzip(p: &Path) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

/// パスを開く。`-` は標準入力、拡張子 `.gz` は展開して読む
pub fn open_reader<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn Read>> {
    let p = path.as_ref();
    if p.to_string_lossy() == "-" {
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, io::stdin())));
    }
    let f = File::open(p)?;
    if is_gzip(p) {
        let dec = flate2::read::GzDecoder::new(f);
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, dec)));
    }
    Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, f)))
}

/// ヘッダ付き CSV リーダ
pub fn csv_reader<P: AsRef<Path>>(path: P) -> io::Result<csv::Reader<Box<dyn Read>>> {
    Ok(csv::ReaderBuilder::new().has_headers(true).flexible(false).from_reader(open_reader(path)?))
}
