use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use netcode_codec::argument::{Vector3, Wire};
use netcode_codec::bitview::{BitReader, BitWriter};
use netcode_codec::identifiers::{BoundObjectIdentifier, ClientIdentifier, PropertyIndex};
use netcode_codec::message_type::MessageFlags;
use netcode_codec::property::PropertyMask;

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitcodec");

    group.throughput(Throughput::Elements(1));
    group.bench_function("pack_unpack_vector3", |b| {
        let v = Vector3 { x: 1.0, y: 2.0, z: 3.0 };
        let mut buf = [0u8; 12];

        b.iter(|| {
            buf = [0u8; 12];
            v.pack(&mut BitWriter::new(&mut buf), MessageFlags::PROPAGATE_CLIENT_TO_HOST)
                .unwrap();
            Vector3::unpack(&mut BitReader::new(&buf), MessageFlags::PROPAGATE_CLIENT_TO_HOST).unwrap()
        })
    });

    group.bench_function("pack_unpack_identifiers", |b| {
        let client = ClientIdentifier::from_slot(512, 4);
        let object = BoundObjectIdentifier::from_slot(70_000, 2);
        let mut buf = [0u8; 8];

        b.iter(|| {
            buf = [0u8; 8];
            let mut w = BitWriter::new(&mut buf);
            client.pack(&mut w).unwrap();
            object.pack(&mut w).unwrap();

            let mut r = BitReader::new(&buf);
            let _ = ClientIdentifier::unpack(&mut r, 4).unwrap();
            let _ = BoundObjectIdentifier::unpack(&mut r, 2).unwrap();
        })
    });

    group.bench_function("pack_unpack_property_mask", |b| {
        let mut mask = PropertyMask::EMPTY;
        for i in [0u8, 3, 7, 15, 31] {
            mask.set(PropertyIndex(i));
        }
        let mut buf = [0u8; 8];

        b.iter(|| {
            buf = [0u8; 8];
            mask.pack(&mut BitWriter::new(&mut buf), 40).unwrap();
            PropertyMask::unpack(&mut BitReader::new(&buf), 40).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
