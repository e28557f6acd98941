//! Throughput benchmarks

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use geiger_core::core::decoder::encode_grgc2_sample;
use geiger_core::core::protocol::{crc16_modbus, FramingType, GeigerCodec};
use geiger_core::{decode, DeviceModel, TubeType};
use std::hint::black_box;
use std::time::Duration;
use tokio_util::codec::Decoder;

fn decode_benchmark(c: &mut Criterion) {
    let grgc1 = br#"{"cpm":360,"cps":6,"dose":2.27,"voltage":400}"#.to_vec();
    let grgc2 = encode_grgc2_sample(60, 400.0);

    let mut group = c.benchmark_group("decode");

    group.bench_function("grgc1_json", |b| {
        b.iter(|| black_box(decode(black_box(&grgc1), DeviceModel::Grgc1)))
    });

    group.bench_function("grgc2_binary", |b| {
        b.iter(|| black_box(decode(black_box(&grgc2), DeviceModel::Grgc2)))
    });

    group.bench_function("grgc2_calibrated", |b| {
        b.iter(|| {
            let reading = decode(black_box(&grgc2), DeviceModel::Grgc2)
                .map(|r| r.calibrated(DeviceModel::Grgc2, TubeType::Sbm20, Duration::from_secs(10)));
            black_box(reading)
        })
    });

    group.finish();
}

fn framing_benchmark(c: &mut Criterion) {
    let mut lines = Vec::new();
    for i in 0..64 {
        lines.extend_from_slice(format!("{{\"cpm\":{},\"cps\":1}}\n", i).as_bytes());
    }
    let mut frames = Vec::new();
    for i in 0..64 {
        frames.extend(encode_grgc2_sample(i, 400.0));
    }

    let mut group = c.benchmark_group("framing");

    group.throughput(Throughput::Bytes(lines.len() as u64));
    group.bench_function("json_lines", |b| {
        b.iter(|| {
            let mut codec = GeigerCodec::new(FramingType::JsonLine);
            let mut buf = BytesMut::from(black_box(&lines[..]));
            let mut n = 0;
            while let Ok(Some(_)) = codec.decode(&mut buf) {
                n += 1;
            }
            black_box(n)
        })
    });

    group.throughput(Throughput::Bytes(frames.len() as u64));
    group.bench_function("binary", |b| {
        b.iter(|| {
            let mut codec = GeigerCodec::new(FramingType::Binary);
            let mut buf = BytesMut::from(black_box(&frames[..]));
            let mut n = 0;
            while let Ok(Some(_)) = codec.decode(&mut buf) {
                n += 1;
            }
            black_box(n)
        })
    });

    group.finish();
}

fn checksum_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("crc16_modbus", |b| b.iter(|| black_box(crc16_modbus(black_box(&data)))));
    group.finish();
}

criterion_group!(benches, decode_benchmark, framing_benchmark, checksum_benchmark);
criterion_main!(benches);
