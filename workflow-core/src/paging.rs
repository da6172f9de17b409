//! Paging primitives — §6 "Every list/history operation takes
//! `{pageNumber, pageSize, sortBy, sortDirection}` and returns `{content,
//! pageNumber, pageSize, totalElements, totalPages}`".

/// Sort direction for a paged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A page request: number (0-based), size, and an optional sort key.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page_number: usize,
    pub page_size: usize,
    pub sort_by: Option<String>,
    pub sort_direction: SortDirection,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page_number: 0,
            page_size: 20,
            sort_by: None,
            sort_direction: SortDirection::Desc,
        }
    }
}

impl PageRequest {
    pub fn new(page_number: usize, page_size: usize) -> Self {
        Self {
            page_number,
            page_size,
            ..Default::default()
        }
    }

    pub fn with_sort(mut self, sort_by: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_by = Some(sort_by.into());
        self.sort_direction = direction;
        self
    }

    fn offset(&self) -> usize {
        self.page_number.saturating_mul(self.page_size)
    }

    /// Slice `items` (already sorted by the caller) into the requested page.
    pub fn paginate<T: Clone>(&self, items: &[T]) -> Page<T> {
        let total_elements = items.len();
        let page_size = self.page_size.max(1);
        let total_pages = total_elements.div_ceil(page_size).max(1);
        let start = self.offset().min(total_elements);
        let end = (start + page_size).min(total_elements);
        Page {
            content: items[start..end].to_vec(),
            page_number: self.page_number,
            page_size: self.page_size,
            total_elements,
            total_pages,
        }
    }
}

/// A page of results, §6 paging contract.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page_number: usize,
    pub page_size: usize,
    pub total_elements: usize,
    pub total_pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginates_middle_page() {
        let items: Vec<u32> = (0..25).collect();
        let request = PageRequest::new(1, 10);
        let page = request.paginate(&items);
        assert_eq!(page.content, (10..20).collect::<Vec<_>>());
        assert_eq!(page.total_elements, 25);
        assert_eq!(page.total_pages, 3);
    }

    #[test]
    fn paginates_past_end_returns_empty() {
        let items: Vec<u32> = (0..5).collect();
        let request = PageRequest::new(5, 10);
        let page = request.paginate(&items);
        assert!(page.content.is_empty());
    }
}
