use cogex_core::stimulus::{GREEN, MARKER_DARK, RED};
use cogex_core::{
    CueShape, Direction, SignalKind, Stage, StimulusDescriptor, StimulusKind, StimulusRenderer,
    Ticket,
};
use cogex_render::{SkiaRenderer, load_font};
use cogex_timing::ManualTimer;
use std::path::Path;

const W: u32 = 320;
const H: u32 = 240;

const FONT_CANDIDATES: [&str; 3] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/Library/Fonts/Arial.ttf",
];

fn renderer(timer: &ManualTimer) -> Option<SkiaRenderer<ManualTimer>> {
    let path = FONT_CANDIDATES.iter().map(Path::new).find(|p| p.exists())?;
    let font = load_font(path).ok()?;
    Some(SkiaRenderer::new(W, H, font, timer.clone()).unwrap())
}

fn ticket(generation: u64, stage: Stage) -> Ticket {
    Ticket { generation, stage }
}

fn pixel(frame: &[u8], x: u32, y: u32) -> [u8; 4] {
    let i = ((y * W + x) * 4) as usize;
    [frame[i], frame[i + 1], frame[i + 2], frame[i + 3]]
}

#[test]
fn test_stage_ends_after_its_duration() {
    let timer = ManualTimer::new();
    let Some(mut r) = renderer(&timer) else {
        return;
    };
    let desc = StimulusDescriptor::new(StimulusKind::Letter {
        content: "X".to_string(),
        color: RED,
    })
    .with_duration(125);
    r.present(&desc, ticket(4, Stage::Test));
    assert_eq!(r.showing_stage(), Some(Stage::Test));
    assert!(r.poll_signal().is_none());

    timer.advance_ms(125);
    let signal = r.poll_signal().unwrap();
    assert_eq!(signal.ticket, ticket(4, Stage::Test));
    assert_eq!(signal.kind, SignalKind::Ended);
}

#[test]
fn cue_and_marker_are_drawn() {
    let timer = ManualTimer::new();
    let Some(mut r) = renderer(&timer) else {
        return;
    };
    let mut frame = vec![0u8; (W * H * 4) as usize];
    let desc = StimulusDescriptor::new(StimulusKind::Cue {
        shape: CueShape::Dot,
        color: GREEN,
    })
    .with_marker(MARKER_DARK);
    r.present(&desc, ticket(1, Stage::Test));
    r.render_frame(&mut frame);

    assert_eq!(pixel(&frame, W / 2, H / 2), GREEN);
    assert_eq!(pixel(&frame, 5, 5), MARKER_DARK);
    assert_eq!(pixel(&frame, W - 5, H - 5), [128, 128, 128, 255]);
}

#[test]
fn stop_clears_the_canvas_on_the_next_frame() {
    let timer = ManualTimer::new();
    let Some(mut r) = renderer(&timer) else {
        return;
    };
    let mut frame = vec![0u8; (W * H * 4) as usize];
    let desc = StimulusDescriptor::new(StimulusKind::Arrow {
        direction: Direction::Right,
        size: 40.0,
        color: RED,
    });
    r.present(&desc, ticket(1, Stage::Adapt));
    r.render_frame(&mut frame);
    r.render_frame(&mut frame);
    assert_eq!(pixel(&frame, W / 2 + 10, H / 2), RED);

    r.stop();
    let stats = r.render_frame(&mut frame);
    assert!(stats.dirty_count > 0);
    assert_eq!(pixel(&frame, W / 2 + 10, H / 2), [128, 128, 128, 255]);
    assert!(r.showing_stage().is_none());
}

#[test]
fn animated_stimuli_render_every_frame() {
    let timer = ManualTimer::new();
    let Some(mut r) = renderer(&timer) else {
        return;
    };
    let mut frame = vec![0u8; (W * H * 4) as usize];
    let desc = StimulusDescriptor::new(StimulusKind::DotMotion {
        direction: Direction::Left,
        coherence: 1.0,
    })
    .with_adapt(StimulusKind::Grating {
        direction: Direction::Right,
    });
    r.present(&desc, ticket(2, Stage::Adapt));
    for _ in 0..3 {
        timer.advance_ms(16);
        assert!(r.render_frame(&mut frame).dirty_count > 0);
    }
    r.present(&desc, ticket(2, Stage::Test));
    timer.advance_ms(16);
    assert!(r.render_frame(&mut frame).dirty_count > 0);
    assert!(r.component_stats("draw").is_some());
    assert!(r.component_stats("blit").is_none());
}

#[test]
fn missing_asset_is_reported_as_load_error() {
    let timer = ManualTimer::new();
    let Some(mut r) = renderer(&timer) else {
        return;
    };
    let desc = StimulusDescriptor::new(StimulusKind::Fixation).with_asset("/no/such/soft1.mp4");
    r.present(&desc, ticket(7, Stage::Load));
    let signal = r.poll_signal().unwrap();
    assert_eq!(signal.ticket, ticket(7, Stage::Load));
    assert!(matches!(signal.kind, SignalKind::Error(ref m) if m.contains("not found")));
}

#[test]
fn image_asset_is_decoded() {
    let timer = ManualTimer::new();
    let Some(mut r) = renderer(&timer) else {
        return;
    };
    let path = std::env::temp_dir().join(format!("cogex-backdrop-{}.png", std::process::id()));
    image::RgbaImage::from_pixel(20, 20, image::Rgba([0, 0, 255, 255]))
        .save(&path)
        .unwrap();

    let desc = StimulusDescriptor::new(StimulusKind::Blank)
        .with_asset(path.to_string_lossy())
        .with_duration(0);
    r.present(&desc, ticket(1, Stage::Load));
    assert_eq!(r.poll_signal().unwrap().kind, SignalKind::Ready);

    let mut frame = vec![0u8; (W * H * 4) as usize];
    r.render_frame(&mut frame);
    std::fs::remove_file(&path).ok();
    assert_eq!(pixel(&frame, W / 2, H / 2), [0, 0, 255, 255]);
}
