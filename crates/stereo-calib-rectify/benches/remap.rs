use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stereo_calib_core::{synthetic::StereoRig, GrayImage, ImageSize};
use stereo_calib_rectify::{init_undistort_rectify_map, remap_gray, stereo_rectify, RectifyOptions};

fn bench_remap(c: &mut Criterion) {
    let rig = StereoRig::reference();
    let rect = stereo_rectify(
        &rig.left,
        &rig.right,
        &rig.relative.rotation,
        &rig.relative.translation,
        rig.image_size,
        &RectifyOptions::default(),
    )
    .expect("rectify");

    let mut group = c.benchmark_group("undistort_rectify_map");
    for (width, height) in [(320, 240), (640, 480), (1280, 960)] {
        let size = ImageSize::new(width, height);
        group.bench_with_input(BenchmarkId::new("build", format!("{width}x{height}")), &size, |b, s| {
            b.iter(|| init_undistort_rectify_map(black_box(&rig.left), &rect.r1, &rect.p1, *s))
        });
    }
    group.finish();

    let table = init_undistort_rectify_map(&rig.left, &rect.r1, &rect.p1, rig.image_size)
        .expect("map");
    let image = GrayImage::from_fn(640, 480, |x, y| ((x ^ y) & 0xff) as u8);
    c.bench_function("remap_gray_640x480", |b| {
        b.iter(|| remap_gray(black_box(&image.view()), &table))
    });
}

criterion_group!(benches, bench_remap);
criterion_main!(benches);
