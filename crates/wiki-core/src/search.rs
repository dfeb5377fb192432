use crate::error::{Result, WikiError};
use crate::group::Group;
use crate::store::{paginate, PageId, Paginated};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Query parameters of a search. Dates are `MM/DD/YYYY` in the group's
/// configured local offset; both bounds are inclusive days.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SearchRequest {
    pub keyword: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub page: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    pub page_id: PageId,
    pub title: String,
    pub modified_on: DateTime<Utc>,
    pub score: f32,
}

/// Midnight at the start of `date` in `offset`, as UTC.
fn local_day_start(date: &str, offset: &FixedOffset) -> Result<DateTime<Utc>> {
    let invalid = || WikiError::InvalidDate(date.to_string());
    let day = NaiveDate::parse_from_str(date.trim(), "%m/%d/%Y").map_err(|_| invalid())?;
    let midnight = day.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(invalid)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Group {
    /// Keyword search over titles and markup, optionally limited to pages
    /// last modified within a date range.
    ///
    /// Results are ordered by relevance, then most recently modified first.
    /// A blank keyword yields an empty result rather than an error.
    pub fn search(&self, request: &SearchRequest) -> Result<Paginated<SearchHit>> {
        let page = request.page.unwrap_or(1).max(1);
        let per_page = self.config.search_page_size;
        let Some(keyword) = non_empty(&request.keyword) else {
            return Ok(Paginated::empty(page, per_page));
        };

        let offset = self.config.local_offset()?;
        let start = non_empty(&request.start)
            .map(|d| local_day_start(d, &offset))
            .transpose()?;
        let end = non_empty(&request.end)
            .map(|d| local_day_start(d, &offset).map(|day| day + Duration::days(1)))
            .transpose()?;

        // Held across the index query so hits and page rows come from the same commit.
        let state = self.read();
        let mut hits: Vec<SearchHit> = self
            .index
            .search_all(keyword)?
            .into_iter()
            .filter_map(|hit| {
                let page = state.pages.get(&hit.page_id)?;
                Some(SearchHit {
                    page_id: page.id,
                    title: page.title.clone(),
                    modified_on: page.modified_on,
                    score: hit.score,
                })
            })
            .filter(|hit| start.map_or(true, |start| hit.modified_on >= start))
            .filter(|hit| end.map_or(true, |end| hit.modified_on < end))
            .collect();
        drop(state);

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.modified_on.cmp(&a.modified_on))
        });
        tracing::debug!(group = %self.name, keyword, hits = hits.len(), "Search");
        Ok(paginate(hits, page, per_page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WikiConfig;
    use crate::render::BasicRenderer;
    use crate::store::HOME_PAGE_ID;
    use std::sync::Arc;

    fn group(config: WikiConfig) -> Group {
        Group::in_memory("main", Arc::new(config), Arc::new(BasicRenderer)).unwrap()
    }

    fn request(keyword: &str) -> SearchRequest {
        SearchRequest {
            keyword: Some(keyword.to_string()),
            ..SearchRequest::default()
        }
    }

    fn set_modified(group: &Group, id: PageId, at: DateTime<Utc>) {
        group.state.write().unwrap().pages.get_mut(&id).unwrap().modified_on = at;
    }

    #[test]
    fn blank_keyword_is_empty() {
        let group = group(WikiConfig::default());
        group.edit_page(HOME_PAGE_ID, 1, "anything").unwrap();
        for keyword in [None, Some(""), Some("   ")] {
            let results = group
                .search(&SearchRequest {
                    keyword: keyword.map(str::to_string),
                    ..SearchRequest::default()
                })
                .unwrap();
            assert!(results.items.is_empty());
            assert_eq!(results.total, 0);
        }
    }

    #[test]
    fn title_hits_rank_above_body_hits() {
        let group = group(WikiConfig::default());
        let lens = group.create_page("Lensing").unwrap();
        group.edit_page(HOME_PAGE_ID, 1, "notes on lensing effects").unwrap();

        let results = group.search(&request("lensing")).unwrap();
        let ids: Vec<_> = results.items.iter().map(|h| h.page_id).collect();
        assert_eq!(ids, vec![lens.id, HOME_PAGE_ID]);
        assert_eq!(results.items[0].title, "Lensing");
    }

    #[test]
    fn equal_scores_fall_back_to_recency() {
        let group = group(WikiConfig::default());
        let older = group.create_page("Older").unwrap();
        let newer = group.create_page("Newer").unwrap();
        group.edit_page(older.id, 1, "photon").unwrap();
        group.edit_page(newer.id, 1, "photon").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        set_modified(&group, older.id, base);
        set_modified(&group, newer.id, base + Duration::days(1));

        let ids: Vec<_> = group
            .search(&request("photon"))
            .unwrap()
            .items
            .iter()
            .map(|h| h.page_id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[test]
    fn date_range_is_inclusive_in_local_time() {
        let group = group(WikiConfig::default());
        let page = group.create_page("Quasar").unwrap();
        // 2024-03-11 03:00 UTC is still March 10 at -06:00.
        set_modified(&group, page.id, Utc.with_ymd_and_hms(2024, 3, 11, 3, 0, 0).unwrap());

        let search = |start: &str, end: &str| {
            group
                .search(&SearchRequest {
                    keyword: Some("quasar".into()),
                    start: Some(start.into()),
                    end: Some(end.into()),
                    page: None,
                })
                .unwrap()
                .total
        };
        assert_eq!(search("03/10/2024", "03/10/2024"), 1);
        assert_eq!(search("03/11/2024", "03/12/2024"), 0);
        assert_eq!(search("", "03/09/2024"), 0);
        assert_eq!(search("03/01/2024", ""), 1);
    }

    #[test]
    fn malformed_dates_are_rejected() {
        let group = group(WikiConfig::default());
        for bad in ["2024-03-10", "13/01/2024", "tomorrow"] {
            let err = group
                .search(&SearchRequest {
                    keyword: Some("home".into()),
                    start: Some(bad.into()),
                    ..SearchRequest::default()
                })
                .unwrap_err();
            assert!(matches!(err, WikiError::InvalidDate(_)), "{bad}");
        }
    }

    #[test]
    fn results_are_paginated() {
        let group = group(WikiConfig {
            search_page_size: 2,
            ..WikiConfig::default()
        });
        for i in 0..5 {
            let page = group.create_page(&format!("Nebula {i}")).unwrap();
            group.edit_page(page.id, 1, "nebula").unwrap();
        }
        let first = group.search(&request("nebula")).unwrap();
        assert_eq!((first.items.len(), first.total, first.page_count), (2, 5, 3));

        let last = group
            .search(&SearchRequest {
                page: Some(3),
                ..request("nebula")
            })
            .unwrap();
        assert_eq!(last.items.len(), 1);
    }
}
