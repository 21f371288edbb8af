#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use imgdna::format::payload::Payload;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(payload) = Payload::open(data) {
                    for name in payload.partition_names() {
                        let _ = payload.partition(&name);
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
