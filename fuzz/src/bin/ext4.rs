#[cfg(not(windows))]
mod fuzz {
    use std::io;

    use honggfuzz::fuzz;
    use imgdna::{
        extract::{self, EntryKind, Volume},
        format::ext4::Ext4Volume,
        report::Report,
    };

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let Ok(volume) = Ext4Volume::new(data) else {
                    return;
                };
                let Ok(entries) = extract::walk(&volume, &mut Report::new()) else {
                    return;
                };

                for entry in entries {
                    if entry.kind == EntryKind::File
                        && let Ok(mut reader) = Volume::open(&volume, entry.node)
                    {
                        let _ = io::copy(&mut reader, &mut io::sink());
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
