//! Chunk planning: split a document into bounded work units, and merge the
//! units' Markdown back into one document.
//!
//! Both directions are synchronous, pure transforms. `merge` never trusts the
//! order of its input and refuses to produce a document with holes in it;
//! given the same set of results it always produces the same bytes, so a
//! retried or resumed run can merge again safely.

use crate::config::PageSeparator;
use crate::document::{Document, PageRange, SourceKind, UnitSource, WorkUnit};
use crate::error::Ocr2MdError;
use crate::output::{MergedDocument, UnitResult};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Splits documents into units of at most `page_budget` pages and merges
/// their results.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    page_budget: usize,
    separator: PageSeparator,
}

impl ChunkPlanner {
    /// A zero budget is treated as one page per unit.
    pub fn new(page_budget: usize, separator: PageSeparator) -> Self {
        Self {
            page_budget: page_budget.max(1),
            separator,
        }
    }

    pub fn page_budget(&self) -> usize {
        self.page_budget
    }

    /// Partition the document into units covering every page once, in order.
    ///
    /// Images always yield a single unit.
    pub fn split(&self, document: &Document) -> Result<Vec<WorkUnit>, Ocr2MdError> {
        match document.kind {
            SourceKind::Image(_) => Ok(vec![WorkUnit {
                document_id: document.id,
                index: 0,
                pages: PageRange::new(1, 1),
                source: UnitSource::Image {
                    path: document.path.clone(),
                },
            }]),
            SourceKind::Pdf => {
                if document.page_count == 0 {
                    return Err(Ocr2MdError::InvalidDocument {
                        path: document.path.clone(),
                        detail: "document has no renderable pages".into(),
                    });
                }
                let units: Vec<WorkUnit> = (1..=document.page_count)
                    .step_by(self.page_budget)
                    .enumerate()
                    .map(|(index, start)| {
                        let end = (start + self.page_budget - 1).min(document.page_count);
                        WorkUnit {
                            document_id: document.id,
                            index,
                            pages: PageRange::new(start, end),
                            source: UnitSource::PdfPages {
                                path: document.path.clone(),
                            },
                        }
                    })
                    .collect();
                debug!(
                    "Planned {} units of ≤{} pages for {} pages",
                    units.len(),
                    self.page_budget,
                    document.page_count
                );
                Ok(units)
            }
        }
    }

    /// Concatenate the successful fragments of units `0..expected` in index
    /// order.
    ///
    /// Failed results count as missing. If any index is missing the merge
    /// fails with [`Ocr2MdError::IncompleteMerge`] naming every gap. When the
    /// same index succeeded more than once, the result with the fewest
    /// attempts is used, ties broken by the lexicographically smallest
    /// fragment, so the output never depends on input order.
    pub fn merge(
        &self,
        results: &[UnitResult],
        expected: usize,
    ) -> Result<MergedDocument, Ocr2MdError> {
        if expected == 0 {
            return Err(Ocr2MdError::Internal("merge called with zero units".into()));
        }

        let mut by_index: BTreeMap<usize, &UnitResult> = BTreeMap::new();
        for r in results.iter().filter(|r| r.succeeded()) {
            if r.index >= expected {
                warn!("Ignoring result for unit {} (expected {})", r.index, expected);
                continue;
            }
            match by_index.entry(r.index) {
                Entry::Vacant(slot) => {
                    slot.insert(r);
                }
                Entry::Occupied(mut slot) => {
                    if duplicate_rank(r) < duplicate_rank(slot.get()) {
                        slot.insert(r);
                    }
                }
            }
        }

        let missing: Vec<usize> = (0..expected).filter(|i| !by_index.contains_key(i)).collect();
        if !missing.is_empty() {
            return Err(Ocr2MdError::IncompleteMerge {
                missing,
                total: expected,
            });
        }

        let mut document_heading: Option<String> = None;
        let mut markdown = String::new();
        for (position, result) in by_index.values().enumerate() {
            let mut fragment = trim_blank_lines(&result.markdown);

            if position == 0 {
                document_heading = first_line(fragment)
                    .filter(|l| l.starts_with('#'))
                    .map(str::to_string);
            } else if let Some(heading) = &document_heading {
                // Engines re-emit the document title at the top of each chunk.
                if first_line(fragment) == Some(heading.as_str()) {
                    fragment = trim_blank_lines(after_first_line(fragment));
                }
            }

            if fragment.is_empty() {
                continue;
            }
            if !markdown.is_empty() {
                markdown.push_str(&self.separator.render(result.pages));
            }
            markdown.push_str(fragment);
        }

        let trimmed = markdown.trim_end();
        let markdown = if trimmed.is_empty() {
            String::from("\n")
        } else {
            format!("{trimmed}\n")
        };

        Ok(MergedDocument {
            markdown,
            unit_count: expected,
        })
    }
}

/// Strip whole blank lines from both ends, keeping indentation of the first
/// content line.
fn trim_blank_lines(s: &str) -> &str {
    let start = s
        .char_indices()
        .take_while(|(_, c)| c.is_whitespace())
        .filter(|(_, c)| *c == '\n')
        .last()
        .map(|(i, _)| i + 1)
        .unwrap_or(0);
    s[start..].trim_end()
}

/// Preference among successful results for the same unit; lower wins.
fn duplicate_rank(r: &UnitResult) -> (u32, &str) {
    (r.attempts, r.markdown.as_str())
}

fn first_line(s: &str) -> Option<&str> {
    s.lines().next().map(str::trim_end)
}

fn after_first_line(s: &str) -> &str {
    match s.find('\n') {
        Some(i) => &s[i + 1..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ImageFormat;
    use crate::error::UnitError;
    use crate::pipeline::engine::FailureCategory;
    use crate::pipeline::probe::ExecutionTier;

    fn planner() -> ChunkPlanner {
        ChunkPlanner::new(4, PageSeparator::None)
    }

    fn ok(index: usize, pages: PageRange, md: &str) -> UnitResult {
        UnitResult {
            index,
            pages,
            markdown: md.to_string(),
            tier: ExecutionTier::Fallback,
            attempts: 1,
            duration_ms: 1,
            engine_log: None,
            error: None,
        }
    }

    fn failed(index: usize, pages: PageRange) -> UnitResult {
        UnitResult {
            markdown: String::new(),
            error: Some(UnitError::FatalInvocation {
                index,
                pages,
                category: FailureCategory::InvalidInput,
                detail: "bad".into(),
            }),
            ..ok(index, pages, "")
        }
    }

    #[test]
    fn split_covers_every_page_once() {
        for pages in 1..=23 {
            for budget in 1..=8 {
                let doc = Document::new("/tmp/x.pdf", SourceKind::Pdf, pages);
                let units = ChunkPlanner::new(budget, PageSeparator::None)
                    .split(&doc)
                    .unwrap();
                assert_eq!(units.len(), pages.div_ceil(budget));
                let mut next = 1;
                for (i, u) in units.iter().enumerate() {
                    assert_eq!(u.index, i);
                    assert_eq!(u.pages.start, next);
                    assert!(u.pages.len() <= budget);
                    next = u.pages.end + 1;
                }
                assert_eq!(next, pages + 1);
            }
        }
    }

    #[test]
    fn split_ten_pages_budget_four() {
        let doc = Document::new("/tmp/x.pdf", SourceKind::Pdf, 10);
        let ranges: Vec<PageRange> = planner().split(&doc).unwrap().iter().map(|u| u.pages).collect();
        assert_eq!(
            ranges,
            vec![PageRange::new(1, 4), PageRange::new(5, 8), PageRange::new(9, 10)]
        );
    }

    #[test]
    fn split_single_page_and_image() {
        let doc = Document::new("/tmp/x.pdf", SourceKind::Pdf, 1);
        assert_eq!(planner().split(&doc).unwrap().len(), 1);

        let img = Document::new("/tmp/x.png", SourceKind::Image(ImageFormat::Png), 1);
        let units = planner().split(&img).unwrap();
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].source, UnitSource::Image { .. }));
    }

    #[test]
    fn split_rejects_empty_pdf() {
        let doc = Document::new("/tmp/x.pdf", SourceKind::Pdf, 0);
        assert!(matches!(
            planner().split(&doc),
            Err(Ocr2MdError::InvalidDocument { .. })
        ));
    }

    #[test]
    fn merge_sorts_by_index() {
        let results = vec![
            ok(2, PageRange::new(9, 10), "third"),
            ok(0, PageRange::new(1, 4), "first"),
            ok(1, PageRange::new(5, 8), "second"),
        ];
        let merged = planner().merge(&results, 3).unwrap();
        assert_eq!(merged.markdown, "first\n\nsecond\n\nthird\n");
        assert_eq!(merged.unit_count, 3);
    }

    #[test]
    fn merge_is_idempotent() {
        let results = vec![
            ok(1, PageRange::new(5, 8), "b\n\n"),
            ok(0, PageRange::new(1, 4), "\n\na"),
        ];
        let p = ChunkPlanner::new(4, PageSeparator::Comment);
        let first = p.merge(&results, 2).unwrap();
        let second = p.merge(&results, 2).unwrap();
        assert_eq!(first.markdown.as_bytes(), second.markdown.as_bytes());
        assert_eq!(first.markdown, "a\n\n<!-- pages 5-8 -->\n\nb\n");
    }

    #[test]
    fn merge_names_missing_index() {
        let results: Vec<UnitResult> = [0, 1, 3, 4]
            .iter()
            .map(|&i| ok(i, PageRange::new(i + 1, i + 1), "x"))
            .collect();
        match planner().merge(&results, 5) {
            Err(Ocr2MdError::IncompleteMerge { missing, total }) => {
                assert_eq!(missing, vec![2]);
                assert_eq!(total, 5);
            }
            other => panic!("expected IncompleteMerge, got {other:?}"),
        }
    }

    #[test]
    fn merge_treats_failed_result_as_missing() {
        let results = vec![
            ok(0, PageRange::new(1, 4), "a"),
            failed(1, PageRange::new(5, 8)),
        ];
        match planner().merge(&results, 2) {
            Err(Ocr2MdError::IncompleteMerge { missing, .. }) => assert_eq!(missing, vec![1]),
            other => panic!("expected IncompleteMerge, got {other:?}"),
        }
    }

    #[test]
    fn merge_drops_repeated_document_heading() {
        let results = vec![
            ok(0, PageRange::new(1, 4), "# Annual Report\n\nIntro text"),
            ok(1, PageRange::new(5, 8), "# Annual Report\n\n## Results\nMore"),
        ];
        let merged = planner().merge(&results, 2).unwrap();
        assert_eq!(merged.markdown.matches("# Annual Report").count(), 1);
        assert!(merged.markdown.contains("Intro text\n\n## Results\nMore\n"));
    }

    #[test]
    fn merge_keeps_indentation_and_single_trailing_newline() {
        let results = vec![ok(0, PageRange::new(1, 1), "\n\n    code block\n\n\n")];
        let merged = planner().merge(&results, 1).unwrap();
        assert_eq!(merged.markdown, "    code block\n");
    }

    #[test]
    fn merge_skips_empty_fragments() {
        let results = vec![
            ok(0, PageRange::new(1, 1), "a"),
            ok(1, PageRange::new(2, 2), "\n\n"),
            ok(2, PageRange::new(3, 3), "c"),
        ];
        let p = ChunkPlanner::new(1, PageSeparator::HorizontalRule);
        assert_eq!(p.merge(&results, 3).unwrap().markdown, "a\n\n---\n\nc\n");
    }

    #[test]
    fn merge_picks_duplicate_independent_of_order() {
        let a = ok(0, PageRange::new(1, 1), "uno");
        let b = ok(0, PageRange::new(1, 1), "one");
        let forward = planner().merge(&[a.clone(), b.clone()], 1).unwrap();
        let backward = planner().merge(&[b, a], 1).unwrap();
        assert_eq!(forward.markdown, backward.markdown);
        assert_eq!(forward.markdown, "one\n");
    }

    #[test]
    fn merge_prefers_duplicate_with_fewer_attempts() {
        let retried = UnitResult {
            attempts: 3,
            ..ok(0, PageRange::new(1, 1), "a retried")
        };
        let first_try = ok(0, PageRange::new(1, 1), "b first try");
        let results = vec![retried, first_try];
        assert_eq!(planner().merge(&results, 1).unwrap().markdown, "b first try\n");
    }
}
