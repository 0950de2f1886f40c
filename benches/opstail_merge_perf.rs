use opstail::opstail_backend::MemoryBackend;
use opstail::opstail_cache::PageCache;
use opstail::opstail_core::{timestamp_from_millis, Cursor, Filters, LogEntry, OperationState};
use opstail::opstail_protocol::{Page, PageRequest};

const PAGE: usize = 50;
const NEWEST_MILLIS: i64 = 1_700_000_000_000;

fn main() {
    divan::main();
}

fn make_entries(len: usize) -> Vec<LogEntry> {
    (0..len)
        .map(|idx| {
            let created_at = timestamp_from_millis(NEWEST_MILLIS - idx as i64 * 250).expect("timestamp");
            let state = OperationState::ALL[idx % OperationState::ALL.len()];
            LogEntry::new(format!("op-{idx:06}"), created_at, "sync", format!("GET /v3/objects page {idx}"))
                .with_state(state)
                .with_integration(if idx % 3 == 0 { "github" } else { "hubspot" })
        })
        .collect()
}

fn make_pages(entries: &[LogEntry]) -> Vec<Page> {
    let total = entries.len() as u64;
    entries
        .chunks(PAGE)
        .map(|chunk| Page {
            entries: chunk.to_vec(),
            forward_cursor: chunk.last().map(Cursor::for_entry),
            backward_cursor: chunk.first().map(Cursor::for_entry),
            total,
        })
        .collect()
}

fn filled_cache(pages: &[Page]) -> PageCache {
    let mut cache = PageCache::new(Filters::operations().key());
    for page in pages {
        cache.append(page.clone());
    }
    cache
}

#[divan::bench(args = [10usize, 40usize, 100usize])]
fn append_pages(bencher: divan::Bencher, pages: usize) {
    let pages = make_pages(&make_entries(pages * PAGE));

    bencher.counter(pages.len() * PAGE).with_inputs(|| pages.clone()).bench_local_values(|pages| {
        let cache = filled_cache(&pages);
        divan::black_box(cache.len());
    });
}

#[divan::bench(args = [10usize, 40usize, 100usize])]
fn replace_head_with_overlap(bencher: divan::Bencher, pages: usize) {
    let entries = make_entries(pages * PAGE + 3);
    // Three unseen entries on top of a head page that overlaps the cache.
    let incoming = Page {
        entries: entries[..PAGE].to_vec(),
        forward_cursor: Some(Cursor::for_entry(&entries[PAGE - 1])),
        backward_cursor: Some(Cursor::for_entry(&entries[0])),
        total: entries.len() as u64,
    };
    let cached = make_pages(&entries[3..]);

    bencher
        .counter(pages * PAGE)
        .with_inputs(|| (filled_cache(&cached), incoming.clone()))
        .bench_local_values(|(mut cache, page)| {
            let outcome = cache.replace_head(page);
            divan::black_box(outcome.added);
        });
}

#[divan::bench(args = [2_048usize, 16_384usize])]
fn backend_search_miss(bencher: divan::Bencher, len: usize) {
    let backend = MemoryBackend::with_entries(make_entries(len));
    let filters = Filters::operations().with_search("does-not-exist");
    let request = PageRequest::head(PAGE);

    bencher.counter(len).bench(|| {
        let page = backend.search(&filters, &request).expect("search");
        divan::black_box(page.total);
    });
}
