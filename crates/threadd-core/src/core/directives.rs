//! Inline directives in inbound messages and forge links in tool output

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::RefType;

static ISSUE_DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*/issue\s+([\w.-]+/[\w.-]+)#(\d+)\b").expect("valid regex")
});

static FORGE_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://github\.com/([\w.-]+/[\w.-]+)/(pull|issues)/(\d+)").expect("valid regex")
});

/// `/issue owner/repo#N`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueDirective {
    pub repo: String,
    pub number: i64,
}

pub fn parse_issue_directive(text: &str) -> Option<IssueDirective> {
    let caps = ISSUE_DIRECTIVE_RE.captures(text)?;
    Some(IssueDirective {
        repo: caps.get(1)?.as_str().to_string(),
        number: caps.get(2)?.as_str().parse().ok()?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeLink {
    pub ref_type: RefType,
    pub repo: String,
    pub number: i64,
    pub url: String,
}

/// Distinct issue / pull request URLs in order of first appearance
pub fn extract_forge_links(text: &str) -> Vec<ForgeLink> {
    let mut links: Vec<ForgeLink> = Vec::new();
    for caps in FORGE_LINK_RE.captures_iter(text) {
        let Ok(number) = caps[3].parse::<i64>() else {
            continue;
        };
        let ref_type = if &caps[2] == "pull" {
            RefType::PullRequest
        } else {
            RefType::Issue
        };
        let link = ForgeLink {
            ref_type,
            repo: caps[1].to_string(),
            number,
            url: caps[0].to_string(),
        };
        if !links
            .iter()
            .any(|l| l.ref_type == link.ref_type && l.repo == link.repo && l.number == link.number)
        {
            links.push(link);
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_directive() {
        assert_eq!(
            parse_issue_directive("/issue acme/app#42"),
            Some(IssueDirective {
                repo: "acme/app".to_string(),
                number: 42
            })
        );
        assert_eq!(
            parse_issue_directive("please look\n  /issue acme/web.site#7 thanks")
                .unwrap()
                .repo,
            "acme/web.site"
        );
        assert!(parse_issue_directive("see /issue acme/app#1").is_none());
        assert!(parse_issue_directive("/issue acme#1").is_none());
    }

    #[test]
    fn test_extract_forge_links() {
        let text = "Created https://github.com/acme/app/pull/12 for https://github.com/acme/app/issues/3 \
                    (again: https://github.com/acme/app/pull/12)";
        let links = extract_forge_links(text);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].ref_type, RefType::PullRequest);
        assert_eq!(links[0].number, 12);
        assert_eq!(links[1].ref_type, RefType::Issue);
        assert_eq!(links[1].url, "https://github.com/acme/app/issues/3");
    }
}
