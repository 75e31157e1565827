use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use image_enlarger::{EnlargeParams, Format, Plane, Rgb, enlarge_plane};

fn textured(width: usize, height: usize) -> Plane<Rgb> {
    let data = (0..width * height)
        .map(|i| {
            let (x, y) = ((i % width) as f32, (i / width) as f32);
            Rgb::new(
                0.5 + 0.4 * (x * 0.13).sin(),
                0.5 + 0.4 * (y * 0.07).cos(),
                0.5 + 0.4 * ((x + y) * 0.05).sin(),
            )
        })
        .collect();
    Plane::from_vec(width, height, data)
}

fn bench_enlarge(c: &mut Criterion) {
    let params = EnlargeParams::default();
    let mut group = c.benchmark_group("enlarge_2x");
    group.sample_size(10);
    for size in [128usize, 256] {
        let src = textured(size, size);
        let format = Format::uniform(size, size, 2.0);
        group.bench_with_input(BenchmarkId::from_parameter(size), &src, |b, src| {
            b.iter(|| enlarge_plane(black_box(src), &format, &params).unwrap())
        });
    }
    group.finish();

    let src = textured(512, 512);
    let format = Format::uniform(512, 512, 0.4);
    c.bench_function("shrink_0.4x_512", |b| {
        b.iter(|| enlarge_plane(black_box(&src), &format, &params).unwrap())
    });
}

criterion_group!(benches, bench_enlarge);
criterion_main!(benches);
