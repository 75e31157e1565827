use image::{GrayImage, Luma, RgbImage};

use image_enlarger::{
    Bitmap, EnlargeParams, Format, Plane, Rgb, TargetSpec, enlarge_bitmap, enlarge_file,
    enlarge_plane,
};

fn no_dither() -> EnlargeParams {
    EnlargeParams {
        dither: 0,
        ..EnlargeParams::default()
    }
}

fn quiet() -> EnlargeParams {
    EnlargeParams {
        denoise: 0,
        dither: 0,
        ..EnlargeParams::default()
    }
}

fn stripes(width: usize, height: usize) -> Plane<Rgb> {
    let mut plane = Plane::filled(width, height, Rgb::splat(0.2));
    for y in 0..height {
        for x in 0..width {
            if (x / 5 + y / 7) % 2 == 0 {
                plane.set(x, y, Rgb::new(0.9, 0.6, 0.1));
            }
        }
    }
    plane
}

#[test]
fn flat_gray_doubles_without_drift() {
    let source = Bitmap::Rgb(Plane::filled(100, 100, Rgb::splat(0.5)));
    let result = enlarge_bitmap(&source, &Format::uniform(100, 100, 2.0), &no_dither()).unwrap();
    assert_eq!(result.dimensions(), (200, 200));
    let Bitmap::Rgb(plane) = result else {
        panic!("layout changed");
    };
    for p in plane.pixels() {
        for c in [p.r, p.g, p.b] {
            assert!((c - 0.5).abs() <= 1.0 / 255.0, "{c}");
        }
    }
}

#[test]
fn flat_gray_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("gray.png");
    let output = dir.path().join("gray_e.png");
    GrayImage::from_pixel(100, 100, Luma([128])).save(&input).unwrap();

    let size = enlarge_file(&input, &output, &TargetSpec::zoom(2.0), None, &no_dither(), 90)
        .unwrap();
    assert_eq!(size, (200, 200));

    let saved = image::open(&output).unwrap().to_rgb8();
    assert_eq!(saved.dimensions(), (200, 200));
    assert!(saved.pixels().all(|p| p.0.iter().all(|&c| c.abs_diff(128) <= 1)));
}

#[test]
fn overhanging_clip_pads_with_black() {
    let src = stripes(40, 30);
    let full_format = Format::uniform(40, 30, 2.0);
    let full = enlarge_plane(&src, &full_format, &quiet()).unwrap();
    assert_eq!((full.width, full.height), (80, 60));

    let clipped = enlarge_plane(&src, &full_format.with_dst_clip(0, 0, 92, 66), &quiet()).unwrap();
    assert_eq!((clipped.width, clipped.height), (92, 66));
    for y in 0..66 {
        for x in 0..92 {
            let got = clipped.get(x, y);
            if x >= 80 || y >= 60 {
                assert_eq!(got, Rgb::splat(0.0), "({x},{y})");
            } else {
                assert_eq!(got, full.get(x, y), "({x},{y})");
            }
        }
    }
}

#[test]
fn fixed_width_target_keeps_aspect() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("wide.png");
    let output = dir.path().join("out").join("wide.jpg");
    RgbImage::from_fn(60, 30, |x, _| image::Rgb([(x * 4) as u8, 90, 200]))
        .save(&input)
        .unwrap();

    let target = TargetSpec::FixedWidth {
        width: 150,
        stretch: 1.0,
    };
    let size = enlarge_file(&input, &output, &target, None, &EnlargeParams::default(), 80).unwrap();
    assert_eq!(size, (150, 75));
    assert_eq!(image::image_dimensions(&output).unwrap(), (150, 75));
}
