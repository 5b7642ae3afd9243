use std::io::{Read, Seek};
use std::process;

use fitscodec::blockfile::{BlockFile, Unit};
use fitscodec::column::TableKind;
use fitscodec::shape::{DataShape, UnitKind};
use fitscodec::{Config, Materialize};

fn describe_kind(kind: &UnitKind) -> String {
    match kind {
        UnitKind::Primary => "Primary".to_string(),
        UnitKind::RandomGroups => "Primary (random groups)".to_string(),
        UnitKind::Image => "IMAGE extension".to_string(),
        UnitKind::Table(TableKind::Binary) => "BINTABLE extension".to_string(),
        UnitKind::Table(TableKind::Ascii) => "TABLE extension".to_string(),
        UnitKind::Other(x) => format!("{x} extension"),
    }
}

fn format_unit(index: usize, unit: &Unit, shape: &DataShape) -> String {
    let mut out = String::new();
    let label = match unit.header().extname() {
        Some(name) => format!(" (EXTNAME: {name})"),
        None => String::new(),
    };
    out.push_str(&format!("HDU {index}: {}{label}\n", describe_kind(&shape.kind)));
    match shape.kind {
        UnitKind::Table(_) => {
            let tfields = unit.header().get_int("TFIELDS").unwrap_or(0);
            out.push_str(&format!("  Columns: {tfields}\n"));
            out.push_str(&format!("  Rows: {}\n", shape.nrows().unwrap_or(0)));
            out.push_str(&format!("  Row width: {} bytes\n", shape.row_width().unwrap_or(0)));
            if shape.heap_len() > 0 {
                out.push_str(&format!("  Heap: {} bytes\n", shape.heap_len()));
            }
        }
        _ => {
            out.push_str(&format!("  BITPIX: {}\n", shape.bitpix));
            out.push_str(&format!("  NAXIS: {}\n", shape.axes.len()));
            if !shape.axes.is_empty() {
                out.push_str(&format!("  Dimensions: {:?}\n", shape.axes));
            }
        }
    }
    out.push_str(&format!("  Header offset: {}\n", unit.header_offset()));
    out.push_str(&format!("  Data size: {} bytes\n", shape.byte_len()));
    out
}

fn format_verbose_cards(unit: &Unit) -> String {
    let mut out = String::from("  Header:\n");
    for card in unit.header() {
        match card.image() {
            Ok(image) => {
                for record in image.as_bytes().chunks(80) {
                    out.push_str("    ");
                    out.push_str(String::from_utf8_lossy(record).trim_end());
                    out.push('\n');
                }
            }
            Err(e) => out.push_str(&format!("    <unrenderable card {}: {e}>\n", card.keyword())),
        }
    }
    out
}

fn format_file_info<S: Read + Seek>(
    file: &mut BlockFile<S>,
    verbose: bool,
) -> fitscodec::Result<String> {
    let count = file.scan()?;
    let mut out = String::new();
    for index in 0..count {
        let Some(handle) = file.unit(index)? else {
            break;
        };
        let shape = file.shape(handle)?.clone();
        let Some(unit) = file.get(handle) else {
            break;
        };
        if index > 0 {
            out.push('\n');
        }
        out.push_str(&format_unit(index, unit, &shape));
        if verbose {
            out.push_str(&format_verbose_cards(unit));
        }
    }
    Ok(out)
}

fn run(args: &[String]) -> Result<String, String> {
    let mut verbose = false;
    let mut file_path = None;

    for arg in args {
        if arg == "-v" || arg == "--verbose" {
            verbose = true;
        } else if arg.starts_with('-') {
            return Err(format!("Unknown option: {arg}"));
        } else {
            if file_path.is_some() {
                return Err("Too many arguments".to_string());
            }
            file_path = Some(arg.as_str());
        }
    }

    let path = file_path.ok_or_else(|| {
        "Usage: fitsinfo [-v] <file.fits>\n\nPrint a summary of each unit in a FITS file."
            .to_string()
    })?;

    let config = Config::default().with_materialize(Materialize::Sequential);
    let mut file =
        BlockFile::open(path, config).map_err(|e| format!("Error opening '{path}': {e}"))?;
    format_file_info(&mut file, verbose).map_err(|e| format!("Error reading '{path}': {e}"))
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(output) => print!("{output}"),
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(1);
        }
    }
}
