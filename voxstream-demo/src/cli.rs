use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use voxstream::backend::{CpalOutput, SoftwareBackend};
use voxstream::source::PcmSource;
use voxstream::{SoftwareBackendDesc, StreamEvent, StreamSession, StreamerDesc, VolumePan};

const FRAME_TIME: Duration = Duration::from_millis(20);

fn start_session() -> Result<(CpalOutput, StreamSession<SoftwareBackend>)> {
    let backend = Arc::new(SoftwareBackend::new(SoftwareBackendDesc::default()));
    let output = CpalOutput::start(&backend)?;

    let mut session = StreamSession::with_backend(backend, StreamerDesc::default());
    session.init()?;
    log::info!(
        "Session ready: {} free voices",
        session.free_voice_count()
    );
    Ok((output, session))
}

/// Tick like a host loop would until every stream has finished.
fn run_until_idle(session: &mut StreamSession<SoftwareBackend>) {
    let started = Instant::now();
    while session.active_count() > 0 {
        session.tick();
        for event in session.poll_events() {
            match event {
                StreamEvent::StreamFailed { stream_id, error } => {
                    log::error!("Stream {} failed: {}", stream_id, error)
                }
                other => log::info!("{:?}", other),
            }
        }
        std::thread::sleep(FRAME_TIME);
    }
    log::info!("All streams finished after {:.2?}", started.elapsed());
}

pub fn play_file(path: &str) -> Result<()> {
    let (output, mut session) = start_session()?;

    log::info!("Streaming {}", path);
    session.play_file(path, VolumePan::centered(0))?;
    run_until_idle(&mut session);

    log::info!("{} frames rendered", output.frames_rendered());
    Ok(())
}

pub fn play_tones() -> Result<()> {
    let (output, mut session) = start_session()?;
    session.set_global_volume(80)?;

    let low = PcmSource::sine(330.0, Duration::from_secs(3), 44100, 1)?;
    let high = PcmSource::sine(495.0, Duration::from_secs(2), 22050, 2)?;

    let left = session.play(low, VolumePan::new(-600, -8000))?;
    let right = session.play(high, VolumePan::new(-600, 8000))?;
    log::info!("Playing stream {} on the left and {} on the right", left, right);

    // sweep the left tone across to the right while it plays
    for step in 0..50 {
        let pan = -8000 + step * 320;
        session.set_volume_pan(left, VolumePan::new(-600, pan))?;
        session.tick();
        std::thread::sleep(FRAME_TIME);
    }

    run_until_idle(&mut session);
    log::info!("{} frames rendered", output.frames_rendered());
    Ok(())
}
