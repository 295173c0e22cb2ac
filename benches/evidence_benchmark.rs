use std::path::PathBuf;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use deploy_harness::capture::{Canvas, EncodeSettings, GifEncoder, ImageEncoder};
use deploy_harness::results::{DEFAULT_MAX_FRAMES, select_frames};

fn benchmark_frame_selection(c: &mut Criterion) {
    let frames: Vec<PathBuf> = (0..10_000).map(|i| PathBuf::from(format!("{}.png", i))).collect();

    c.bench_function("select_frames_10000", |b| {
        b.iter(|| select_frames(black_box(&frames), DEFAULT_MAX_FRAMES))
    });
}

fn benchmark_gif_encoding(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let frames: Vec<PathBuf> = (0..20u8)
        .map(|i| {
            let path = dir.path().join(format!("{}.png", i));
            let mut canvas = Canvas::with_color(320, 240, [0, 64, 128]);
            canvas.fill_rect(0, 0, u32::from(i) * 16, 20, [40, 200, 40]);
            canvas.draw_text(8, 40, &format!("Installing... {}%", i * 5), [255, 255, 255], [0, 64, 128]);
            std::fs::write(&path, canvas.to_png().expect("png")).expect("write frame");
            path
        })
        .collect();
    let output = dir.path().join("install_bench.gif");
    let settings = EncodeSettings::default();

    c.bench_function("gif_encode_20_frames", |b| {
        b.iter(|| {
            GifEncoder
                .encode(black_box(&frames), &output, &settings)
                .expect("encode");
        })
    });
}

criterion_group!(benches, benchmark_frame_selection, benchmark_gif_encoding);
criterion_main!(benches);
