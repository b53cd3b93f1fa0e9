/// Reverses the label order of a domain name, `www.example.com` becoming
/// `com.example.www`. Issued names are indexed in this form so that "a domain
/// and all of its subdomains" is a single prefix range.
pub fn reverse_name(domain: &str) -> String {
    let mut labels = domain.split('.').collect::<Vec<_>>();
    labels.reverse();
    labels.join(".")
}

/// Lower-cases, sorts and de-duplicates a list of names.
pub fn unique_lowercase_names(names: &[String]) -> Vec<String> {
    let mut names = names.iter().map(|n| n.to_lowercase()).collect::<Vec<_>>();
    names.sort();
    names.dedup();
    names
}

/// `LIKE` pattern matching every strict subdomain of an already reversed name.
pub(crate) fn subdomain_pattern(reversed: &str) -> String {
    let mut pattern = String::with_capacity(reversed.len() + 2);
    for c in reversed.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(".%");
    pattern
}
