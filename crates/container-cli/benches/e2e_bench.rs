//! End-to-end pipeline benchmarks: open an EPUB, rename/add a file, commit.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use container_epub::EpubContainer;
use container_utils::archive::ZipBuilder;

/// Builds a minimal EPUB with `n` chapters at `zip_path`.
fn make_epub(zip_path: &std::path::Path, n: usize) {
    let mut manifest = String::new();
    let mut spine = String::new();
    for i in 0..n {
        manifest.push_str(&format!(
            "<item id=\"c{i}\" href=\"text/c{i}.xhtml\" media-type=\"application/xhtml+xml\"/>"
        ));
        spine.push_str(&format!("<itemref idref=\"c{i}\"/>"));
    }
    let opf = format!(
        "<?xml version=\"1.0\"?><package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"2.0\">\
         <metadata><dc:identifier xmlns:dc=\"http://purl.org/dc/elements/1.1/\" id=\"bookid\">urn:uuid:bench</dc:identifier></metadata>\
         <manifest>{manifest}</manifest><spine>{spine}</spine></package>"
    );
    let container_xml = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

    let mut builder = ZipBuilder::new(zip_path).unwrap();
    builder.add_stored("mimetype", b"application/epub+zip").unwrap();
    builder.add_file("META-INF/container.xml", container_xml.as_bytes()).unwrap();
    builder.add_file("content.opf", opf.as_bytes()).unwrap();
    for i in 0..n {
        builder
            .add_file(
                &format!("text/c{i}.xhtml"),
                format!("<html><body><p>Chapter {i}</p></body></html>").as_bytes(),
            )
            .unwrap();
    }
    builder.finish().unwrap();
}

fn bench_open_and_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("EpubContainer");

    group.bench_function("open_and_spine_iter_100_chapters", |b| {
        b.iter(|| {
            let tmp = tempfile::tempdir().unwrap();
            let zip_path = tmp.path().join("book.epub");
            make_epub(&zip_path, 100);
            let mut epub =
                EpubContainer::open(&zip_path, tmp.path().join("work")).unwrap();
            black_box(epub.base.spine_iter().unwrap());
        })
    });

    group.bench_function("rename_and_commit_100_chapters", |b| {
        b.iter(|| {
            let tmp = tempfile::tempdir().unwrap();
            let zip_path = tmp.path().join("book.epub");
            make_epub(&zip_path, 100);
            let mut epub =
                EpubContainer::open(&zip_path, tmp.path().join("work")).unwrap();
            epub.rename("text/c0.xhtml", "text/renamed.xhtml").unwrap();
            let out = tmp.path().join("out.epub");
            epub.commit(&out).unwrap();
            black_box(&out);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_open_and_list);
criterion_main!(benches);
