//! Benchmarks for container core operations.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use container_core::container::BaseContainer;
use container_core::xmltree::XmlDocument;

fn make_book(dir: &std::path::Path, n: usize) -> String {
    std::fs::create_dir_all(dir.join("OEBPS/text")).unwrap();
    let mut manifest = String::new();
    let mut spine = String::new();
    for i in 0..n {
        manifest.push_str(&format!(
            "<item id=\"c{i}\" href=\"OEBPS/text/c{i}.xhtml\" media-type=\"application/xhtml+xml\"/>"
        ));
        spine.push_str(&format!("<itemref idref=\"c{i}\"/>"));
        std::fs::write(
            dir.join(format!("OEBPS/text/c{i}.xhtml")),
            format!("<html><body><p>Chapter {i}</p></body></html>"),
        )
        .unwrap();
    }
    std::fs::write(
        dir.join("content.opf"),
        format!(
            "<?xml version=\"1.0\"?><package xmlns=\"http://www.idpf.org/2007/opf\"><metadata/><manifest>{manifest}</manifest><spine>{spine}</spine></package>"
        ),
    )
    .unwrap();
    "content.opf".to_string()
}

fn bench_open_and_spine_iter(c: &mut Criterion) {
    let mut group = c.benchmark_group("Container");

    group.bench_function("open_and_spine_iter_100_items", |b| {
        b.iter(|| {
            let tmp = tempfile::tempdir().unwrap();
            let opf = make_book(tmp.path(), 100);
            let mut container = BaseContainer::from_directory(tmp.path().to_path_buf(), opf).unwrap();
            black_box(container.spine_iter().unwrap());
        })
    });

    group.bench_function("add_file_100_items", |b| {
        b.iter(|| {
            let tmp = tempfile::tempdir().unwrap();
            let opf = make_book(tmp.path(), 1);
            let mut container = BaseContainer::from_directory(tmp.path().to_path_buf(), opf).unwrap();
            for i in 0..100 {
                container
                    .add_file(
                        &format!("OEBPS/text/extra{i}.xhtml"),
                        b"<html><body/></html>",
                        Some("application/xhtml+xml"),
                    )
                    .unwrap();
            }
            black_box(&container);
        })
    });

    group.bench_function("manifest_id_map_1000_items", |b| {
        let tmp = tempfile::tempdir().unwrap();
        let opf = make_book(tmp.path(), 1000);
        let mut container = BaseContainer::from_directory(tmp.path().to_path_buf(), opf).unwrap();
        b.iter(|| {
            black_box(container.manifest_id_map().unwrap());
        })
    });

    group.finish();
}

fn bench_xmltree_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("XmlTree");

    let small = "<package><manifest><item id=\"a\" href=\"a.xhtml\"/></manifest></package>";
    let mut large = String::from("<package><manifest>");
    for i in 0..1000 {
        large.push_str(&format!("<item id=\"i{i}\" href=\"i{i}.xhtml\"/>"));
    }
    large.push_str("</manifest></package>");

    group.bench_function("parse_small_opf", |b| {
        b.iter(|| black_box(XmlDocument::parse(small).unwrap()))
    });

    group.bench_function("parse_1000_item_manifest", |b| {
        b.iter(|| black_box(XmlDocument::parse(&large).unwrap()))
    });

    group.bench_function("serialize_1000_item_manifest", |b| {
        let doc = XmlDocument::parse(&large).unwrap();
        b.iter(|| black_box(doc.to_string_pretty(false)))
    });

    group.finish();
}

criterion_group!(benches, bench_open_and_spine_iter, bench_xmltree_parse);
criterion_main!(benches);
