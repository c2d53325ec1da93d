//! Scans a transport stream file and prints every DAB ensemble found.
//!
//! ```text
//! cargo run --example scan -- capture.ts
//! ```

use dvbdab_reader::scanner;
use std::env;

fn main() {
    env_logger::init();
    let mut args = env::args();
    args.next();
    let name = match args.next() {
        Some(name) => name,
        None => {
            eprintln!("usage: scan <file.ts>");
            std::process::exit(1);
        }
    };
    let results = scanner::scan_ts_file(&name, 30_000);
    if results.is_empty() {
        println!("no DAB ensembles found in {}", name);
        return;
    }
    for ens in results {
        println!(
            "{} ensemble {:#06x} '{}'{}",
            ens.address(),
            ens.eid,
            ens.label,
            if ens.is_etina {
                match ens.etina_info {
                    Some(info) => format!(
                        " (padding {}, bit offset {}, {})",
                        info.padding_bytes,
                        info.bit_offset,
                        if info.inverted { "inverted" } else { "normal" }
                    ),
                    None => String::new(),
                }
            } else {
                String::new()
            }
        );
        for svc in &ens.services {
            println!(
                "  {:#06x} {:<16} {:>3} kbit/s  subch {:>2}  {}",
                svc.sid,
                svc.label,
                svc.bitrate_kbps,
                svc.subchannel_id,
                if svc.dabplus { "DAB+" } else { "DAB" }
            );
        }
    }
}
