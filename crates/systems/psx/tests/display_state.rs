use std::sync::{Arc, Mutex};

use emu_core::host_display::{HeadlessDisplay, HostDisplay};
use emu_core::types::Frame;
use emu_psx::display::DisplayConfig;
use emu_psx::gpu_hw::PrimitiveFlags;
use emu_psx::types::DownsampleMode;
use emu_psx::{
    GpuBackend, GpuError, GpuHw, GpuSettings, PresentSink, PresentStatus, Presenter, SoftwareBackend, VramSnapshot,
};

#[derive(Clone, Default)]
struct RecordingSink {
    frames: Arc<Mutex<Vec<(u32, u32, u32)>>>,
}

impl PresentSink for RecordingSink {
    fn present(&mut self, frame: &Frame) -> PresentStatus {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push((frame.width, frame.height, frame.pixel(0, 0)));
        }
        PresentStatus::Ok
    }
}

fn gpu(host: &mut HeadlessDisplay, settings: GpuSettings) -> GpuHw<SoftwareBackend> {
    GpuHw::new(SoftwareBackend::new(), host, &settings).expect("gpu")
}

#[test]
fn direct_display_shows_the_scaled_framebuffer() {
    let mut host = HeadlessDisplay::new();
    let mut gpu = gpu(&mut host, GpuSettings { resolution_scale: 2, ..Default::default() });
    gpu.fill_vram(0, 0, 320, 240, 0x001F);
    gpu.update_display(&mut host, &DisplayConfig::default()).expect("display");

    let view = host.display_view().copied().expect("direct path hands over a texture");
    assert_eq!((view.view_width.unsigned_abs(), view.view_height.unsigned_abs()), (640, 480));

    let mut frame = Frame::default();
    assert!(host.render_screenshot(&mut frame));
    assert_eq!((frame.width, frame.height), (640, 480));
    assert_eq!(frame.pixel(639, 479), 0xFFFF0000);

    gpu.shutdown(&mut host);
    assert_eq!(host.texture_count(), 0);
}

#[test]
fn true_color_display_decodes_packed_pixels() {
    let mut host = HeadlessDisplay::new();
    let mut gpu = gpu(&mut host, GpuSettings::default());
    gpu.update_vram(0, 0, 3, 1, &[0x3412, 0xBC56, 0xF0DE], false, false).expect("write");
    let config = DisplayConfig { color_24bit: true, ..Default::default() };
    gpu.update_display(&mut host, &config).expect("display");

    assert!(host.display_view().is_none());
    let mut frame = Frame::default();
    assert!(host.render_screenshot(&mut frame));
    assert_eq!((frame.width, frame.height), (320, 240));
    assert_eq!(frame.pixel(0, 0), 0xFF123456);
    assert_eq!(frame.pixel(1, 0), 0xFFBCDEF0);
    assert_eq!(frame.pixel(0, 1), 0xFF000000);
}

#[test]
fn disabled_display_presents_nothing() {
    let mut host = HeadlessDisplay::new();
    let mut gpu = gpu(&mut host, GpuSettings::default());
    let sink = RecordingSink::default();
    let mut presenter = Presenter::new(Box::new(sink.clone()), 2, false).expect("presenter");

    let config = DisplayConfig { enabled: false, ..Default::default() };
    gpu.update_display(&mut host, &config).expect("display");
    assert!(!gpu.present(&mut host, &mut presenter));
    assert_eq!(presenter.frames_presented(), 0);
}

#[test]
fn present_hands_the_displayed_frame_to_the_sink() {
    for threaded in [false, true] {
        let mut host = HeadlessDisplay::new();
        let mut gpu = gpu(&mut host, GpuSettings::default());
        let sink = RecordingSink::default();
        let mut presenter = Presenter::new(Box::new(sink.clone()), 2, threaded).expect("presenter");

        gpu.draw_rectangle(0, 0, 16, 16, 0x00FF00, (0, 0), PrimitiveFlags::default());
        gpu.update_display(&mut host, &DisplayConfig::default()).expect("display");
        assert!(gpu.present(&mut host, &mut presenter));
        presenter.wait_for_present_complete();
        presenter.shutdown();

        let frames = sink.frames.lock().expect("lock").clone();
        assert_eq!(frames, vec![(320, 240, 0xFF00FF00)], "threaded = {}", threaded);
    }
}

#[test]
fn presented_frames_match_the_display_output_size() {
    let cases = [
        (GpuSettings { resolution_scale: 2, ..Default::default() }, false, (640, 480)),
        (GpuSettings { resolution_scale: 2, ..Default::default() }, true, (320, 240)),
        (GpuSettings { resolution_scale: 2, multisamples: 4, ..Default::default() }, false, (640, 480)),
        (
            GpuSettings { resolution_scale: 3, downsample_mode: DownsampleMode::Box, ..Default::default() },
            false,
            (320, 240),
        ),
    ];
    for (settings, color_24bit, size) in cases {
        let mut host = HeadlessDisplay::new();
        let mut gpu = gpu(&mut host, settings);
        let sink = RecordingSink::default();
        let mut presenter = Presenter::new(Box::new(sink.clone()), 2, false).expect("presenter");

        assert_eq!(gpu.display_size(), None);
        gpu.update_display(&mut host, &DisplayConfig { color_24bit, ..Default::default() }).expect("display");
        assert_eq!(gpu.display_size(), Some(size));
        assert!(gpu.present(&mut host, &mut presenter));
        presenter.wait_for_present_complete();

        let frames = sink.frames.lock().expect("lock").clone();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].0, frames[0].1), size);
    }
}

#[test]
fn turning_the_display_off_stops_presenting() {
    let mut host = HeadlessDisplay::new();
    let mut gpu = gpu(&mut host, GpuSettings::default());
    let sink = RecordingSink::default();
    let mut presenter = Presenter::new(Box::new(sink.clone()), 2, false).expect("presenter");

    gpu.update_display(&mut host, &DisplayConfig::default()).expect("display");
    assert!(gpu.present(&mut host, &mut presenter));
    gpu.update_display(&mut host, &DisplayConfig { enabled: false, ..Default::default() }).expect("display");
    assert_eq!(gpu.display_size(), None);
    assert!(!gpu.present(&mut host, &mut presenter));
    assert_eq!(presenter.frames_presented(), 1);
}

#[test]
fn snapshot_load_recreates_a_mismatched_state_texture() {
    let mut host = HeadlessDisplay::new();
    let mut source = gpu(&mut host, GpuSettings::default());
    source.fill_vram(10, 10, 4, 4, 0x1234);
    let snapshot = source.save_state().expect("save");

    let mut target = gpu(&mut host, GpuSettings { resolution_scale: 2, ..Default::default() });
    assert!(target.backend_mut().prepare_state_texture(16, 16).expect("small state texture"));
    target.load_state(&snapshot).expect("load");
    // Back at full size, so the next request is a no-op
    assert!(!target.backend_mut().prepare_state_texture(1024, 512).expect("state texture"));
    assert_eq!(target.read_vram(10, 10, 4, 1).expect("read"), vec![0x1234; 4]);
}

#[test]
fn snapshot_of_another_size_is_rejected_untouched() {
    let mut host = HeadlessDisplay::new();
    let mut gpu = gpu(&mut host, GpuSettings::default());
    gpu.fill_vram(0, 0, 8, 8, 0x7C00);

    let small = VramSnapshot { width: 512, height: 256, samples: 1, resolution_scale: 1, words: vec![0x001F; 512 * 256] };
    match gpu.load_state(&small) {
        Err(GpuError::InvalidState(message)) => assert!(message.contains("512x256"), "{}", message),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(gpu.read_vram(0, 0, 2, 1).expect("read"), vec![0x7C00, 0x7C00]);
}

#[test]
fn snapshot_survives_a_scale_and_multisample_change() {
    let mut host = HeadlessDisplay::new();
    let mut native = gpu(&mut host, GpuSettings::default());
    native.fill_vram(0, 0, 64, 64, 0x7C00);
    native.draw_rectangle(8, 8, 16, 16, 0x0000FF, (0, 0), PrimitiveFlags::default());
    native.update_vram(500, 300, 2, 1, &[0x8123, 0x0456], false, false).expect("write");
    let bytes = native.save_state().expect("save").to_bytes();

    let mut scaled = gpu(&mut host, GpuSettings { resolution_scale: 2, multisamples: 2, ..Default::default() });
    let snapshot = VramSnapshot::from_bytes(&bytes).expect("parse");
    assert_eq!((snapshot.resolution_scale, snapshot.samples), (1, 1));
    scaled.load_state(&snapshot).expect("load");

    let restored = scaled.save_state().expect("save");
    assert_eq!((restored.resolution_scale, restored.samples), (2, 2));
    assert!(restored.words == snapshot.words);
    assert_eq!(scaled.read_vram(500, 300, 2, 1).expect("read"), vec![0x8123, 0x0456]);

    // Restored mask bits still protect pixels from check-mask drawing
    scaled.set_mask_settings(false, true);
    scaled.draw_rectangle(500, 300, 2, 1, 0x00FF00, (0, 0), PrimitiveFlags::default());
    assert_eq!(scaled.read_vram(500, 300, 2, 1).expect("read"), vec![0x8123, 0x03E0]);
}

#[test]
fn program_binaries_are_reused_across_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = GpuSettings { shader_cache_path: Some(dir.path().to_path_buf()), ..Default::default() };

    {
        let mut host = HeadlessDisplay::new();
        let gpu = gpu(&mut host, settings.clone());
        let stats = gpu.backend().shader_cache_stats();
        assert_eq!((stats.compiles, stats.disk_loads, stats.memory_hits), (126, 0, 32));
    }

    let mut host = HeadlessDisplay::new();
    let gpu = gpu(&mut host, settings);
    let stats = gpu.backend().shader_cache_stats();
    assert_eq!((stats.compiles, stats.disk_loads, stats.memory_hits), (0, 126, 32));
}
