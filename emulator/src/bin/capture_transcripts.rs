use std::io;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Session, TranscriptProfile};

/// Replays every profile once, leaving the wire transcripts under
/// `transcripts/` for documentation and regression review.
fn main() -> io::Result<()> {
    for profile in [
        TranscriptProfile::ColdBoot,
        TranscriptProfile::MtReceive,
        TranscriptProfile::RfDrop,
    ] {
        let mut session = Session::new(profile)?;
        let summary = session.handle_command("run")?;
        println!("== {} ==", profile.tag());
        for line in summary {
            println!("{line}");
        }
    }
    Ok(())
}
