use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{Datelike, Local, NaiveDate};
use image::imageops::FilterType;
use scraper::{ElementRef, Html, Selector};
use serenity::all::{
    ChannelId, Colour, CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter, CreateMessage, Http,
};
use tracing::{debug, error, info, warn};

use crate::db::Database;

pub const NEWS_URL: &str = "https://animotaku.fr/actualite-manga-anime/";

const FRENCH_MONTHS: [&str; 12] = [
    "janvier", "février", "mars", "avril", "mai", "juin", "juillet", "août", "septembre",
    "octobre", "novembre", "décembre",
];

const ANIME_KEYWORDS: [&str; 5] = ["anime", "épisode", "episode", "épisodes", "episodes"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    pub link: String,
    pub date: String,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Anime,
    Manga,
    News,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Self::Anime => "Anime",
            Self::Manga => "Manga",
            Self::News => "News",
        }
    }
}

impl Article {
    /// Dedupe key stored in `sent_articles`.
    pub fn hash(&self) -> String {
        sha256::digest(format!("{}{}{}", self.title, self.link, self.date))
    }

    pub fn category(&self) -> Category {
        let title = self.title.to_lowercase();
        if ANIME_KEYWORDS.iter().any(|k| title.contains(k)) {
            Category::Anime
        } else if title.contains("manga") {
            Category::Manga
        } else {
            Category::News
        }
    }
}

/// `2025-03-07` -> `"7 mars 2025"`, the way the site prints dates.
pub fn french_date(date: NaiveDate) -> String {
    format!(
        "{} {} {}",
        date.day(),
        FRENCH_MONTHS[date.month0() as usize],
        date.year()
    )
}

/// Extracts articles from the Elementor post listing.
pub struct ArticleParser {
    article: Selector,
    title: Selector,
    date: Selector,
    thumbnail: Selector,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {}: {:?}", css, e))
}

/// Text content with whitespace collapsed.
fn text_of(element: ElementRef<'_>) -> String {
    let text: String = element.text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl ArticleParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            article: selector("div.elementor-posts-container article.elementor-post")?,
            title: selector("h3.elementor-post__title a")?,
            date: selector("span.elementor-post-date")?,
            thumbnail: selector("a.elementor-post__thumbnail__link img")?,
        })
    }

    pub fn parse(&self, html: &str) -> Vec<Article> {
        let document = Html::parse_document(html);

        document
            .select(&self.article)
            .filter_map(|article| {
                let title = article.select(&self.title).next()?;
                let link = title.value().attr("href")?.trim().to_string();
                let date = article.select(&self.date).next().map(text_of).unwrap_or_default();

                Some(Article {
                    title: text_of(title),
                    link,
                    date,
                    thumbnail: self.thumbnail_url(article),
                })
            })
            .collect()
    }

    fn thumbnail_url(&self, article: ElementRef<'_>) -> Option<String> {
        let img = article.select(&self.thumbnail).next()?.value();
        let url = img.attr("data-lazy-src").or_else(|| img.attr("src"))?.trim();

        if url.is_empty() {
            None
        } else if url.starts_with("//") {
            Some(format!("https:{}", url))
        } else {
            Some(url.to_string())
        }
    }
}

/// Articles whose printed date is `day`.
pub fn published_on(articles: Vec<Article>, day: NaiveDate) -> Vec<Article> {
    let wanted = french_date(day);
    articles
        .into_iter()
        .filter(|article| article.date.trim().to_lowercase() == wanted)
        .collect()
}

/// Most frequent colour of the pixels, the first one to reach the top count wins ties.
pub fn dominant_rgb(pixels: impl IntoIterator<Item = [u8; 3]>) -> Option<[u8; 3]> {
    let mut counts: HashMap<[u8; 3], usize> = HashMap::new();
    let mut best: Option<([u8; 3], usize)> = None;

    for pixel in pixels {
        let count = counts.entry(pixel).or_insert(0);
        *count += 1;
        if best.map_or(true, |(_, top)| *count > top) {
            best = Some((pixel, *count));
        }
    }

    best.map(|(rgb, _)| rgb)
}

pub struct AnimeNews {
    client: reqwest::Client,
    parser: ArticleParser,
}

impl AnimeNews {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (compatible; HermesBot)")
            .build()?;

        Ok(Self {
            client,
            parser: ArticleParser::new()?,
        })
    }

    pub async fn fetch_articles(&self) -> Result<Vec<Article>> {
        let response = self.client.get(NEWS_URL).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("news listing returned HTTP {}", response.status()));
        }

        let html = response.text().await?;
        let articles = self.parser.parse(&html);
        info!("[ANIME] Fetched {} article(s) from the listing", articles.len());
        Ok(articles)
    }

    async fn dominant_colour(&self, url: &str) -> Result<Colour> {
        let bytes = self.client.get(url).send().await?.error_for_status()?.bytes().await?;
        let image = image::load_from_memory(&bytes)?
            .resize_exact(100, 100, FilterType::Nearest)
            .to_rgb8();

        let [r, g, b] = dominant_rgb(image.pixels().map(|p| p.0))
            .ok_or_else(|| anyhow!("image has no pixels"))?;
        Ok(Colour::from_rgb(r, g, b))
    }

    fn embed(article: &Article, colour: Colour) -> CreateEmbed {
        let mut embed = CreateEmbed::new()
            .title(format!("{} News !", article.category().label()))
            .description(&article.title)
            .url(&article.link)
            .colour(colour)
            .author(CreateEmbedAuthor::new("Hermes Bot"))
            .footer(CreateEmbedFooter::new(format!(
                "📰 Published {} • Source: Animotaku.fr",
                article.date
            )));

        if let Some(thumbnail) = &article.thumbnail {
            embed = embed.image(thumbnail);
        }
        embed
    }

    /// Posts yesterday's articles that were not posted before. Returns how many were sent.
    pub async fn post_new_articles(&self, http: &Http, db: &Database, channel_id: ChannelId) -> Result<usize> {
        let yesterday = Local::now().date_naive().pred_opt().ok_or_else(|| anyhow!("date underflow"))?;
        let articles = published_on(self.fetch_articles().await?, yesterday);

        if articles.is_empty() {
            info!("[ANIME] No article from {} to post", french_date(yesterday));
            return Ok(0);
        }

        let mut sent = 0;
        for article in &articles {
            let hash = article.hash();
            if db.is_article_sent(&hash).await? {
                debug!("[ANIME] Already posted: {}", article.title);
                continue;
            }

            let colour = match &article.thumbnail {
                Some(url) => self.dominant_colour(url).await.unwrap_or_else(|e| {
                    warn!("[ANIME] Could not compute dominant colour of {}: {}", url, e);
                    Colour::BLUE
                }),
                None => Colour::BLUE,
            };

            let message = CreateMessage::new().embed(Self::embed(article, colour));
            if let Err(e) = channel_id.send_message(http, message).await {
                error!("[ANIME] Failed to post {}: {}", article.title, e);
                continue;
            }

            db.mark_article_sent(&hash, &article.title, &article.link).await?;
            sent += 1;
            info!("[ANIME] Posted: {}", article.title);

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
<div class="elementor-posts-container elementor-posts">
  <article class="elementor-post elementor-grid-item post-1 type-post">
    <a class="elementor-post__thumbnail__link" href="https://animotaku.fr/one-piece/">
      <div class="elementor-post__thumbnail">
        <img width="300" src="data:image/svg+xml,placeholder" data-lazy-src="//animotaku.fr/img/one-piece.jpg" alt="">
      </div>
    </a>
    <div class="elementor-post__text">
      <h3 class="elementor-post__title">
        <a href="https://animotaku.fr/one-piece/">
          One Piece : l&#8217;épisode 1100 date de sortie
        </a>
      </h3>
      <div class="elementor-post__meta-data">
        <span class="elementor-post-date">
          7 mars 2025
        </span>
      </div>
    </div>
  </article>
  <article class="elementor-post elementor-grid-item post-2 type-post">
    <a class="elementor-post__thumbnail__link" href="https://animotaku.fr/berserk/">
      <img src="https://animotaku.fr/img/berserk.png" alt="">
    </a>
    <h3 class="elementor-post__title"><a href="https://animotaku.fr/berserk/">Le manga Berserk &amp; son retour</a></h3>
    <span class="elementor-post-date">6 mars 2025</span>
  </article>
  <article class="elementor-post post-3">
    <h3 class="elementor-post__title"><a href="https://animotaku.fr/salon/">Japan Expo annonce ses invités</a></h3>
  </article>
</div>
"#;

    #[test]
    fn test_parse_listing() {
        let articles = ArticleParser::new().unwrap().parse(LISTING);
        assert_eq!(articles.len(), 3);

        assert_eq!(articles[0].title, "One Piece : l\u{2019}épisode 1100 date de sortie");
        assert_eq!(articles[0].link, "https://animotaku.fr/one-piece/");
        assert_eq!(articles[0].date, "7 mars 2025");
        assert_eq!(
            articles[0].thumbnail.as_deref(),
            Some("https://animotaku.fr/img/one-piece.jpg")
        );

        assert_eq!(articles[1].title, "Le manga Berserk & son retour");
        assert_eq!(
            articles[1].thumbnail.as_deref(),
            Some("https://animotaku.fr/img/berserk.png")
        );

        assert_eq!(articles[2].date, "");
        assert_eq!(articles[2].thumbnail, None);
    }

    #[test]
    fn test_named_entities_are_decoded() {
        let html = r#"
<div class="elementor-posts-container">
  <article class="elementor-post">
    <h3 class="elementor-post__title"><a href="https://animotaku.fr/x/">L&rsquo;anime d&eacute;voil&eacute; &hellip;</a></h3>
    <span class="elementor-post-date">6&nbsp;mars 2025</span>
  </article>
</div>
"#;
        let articles = ArticleParser::new().unwrap().parse(html);

        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].title, "L\u{2019}anime dévoilé \u{2026}");
        assert_eq!(articles[0].date, "6 mars 2025");
    }

    #[test]
    fn test_articles_outside_listing_are_ignored() {
        let html = r#"
<aside>
  <article class="elementor-post">
    <h3 class="elementor-post__title"><a href="https://animotaku.fr/sidebar/">Sidebar</a></h3>
  </article>
</aside>
"#;
        assert!(ArticleParser::new().unwrap().parse(html).is_empty());
    }

    #[test]
    fn test_french_date_has_no_leading_zero() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(french_date(date), "7 mars 2025");

        let date = NaiveDate::from_ymd_opt(2024, 8, 15).unwrap();
        assert_eq!(french_date(date), "15 août 2024");

        let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert_eq!(french_date(date), "31 décembre 2024");
    }

    #[test]
    fn test_published_on_keeps_matching_day() {
        let articles = ArticleParser::new().unwrap().parse(LISTING);
        let day = NaiveDate::from_ymd_opt(2025, 3, 6).unwrap();

        let kept = published_on(articles, day);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].link, "https://animotaku.fr/berserk/");
    }

    #[test]
    fn test_category() {
        let article = |title: &str| Article {
            title: title.to_string(),
            link: String::new(),
            date: String::new(),
            thumbnail: None,
        };

        assert_eq!(article("Nouvel ANIME annoncé").category(), Category::Anime);
        assert_eq!(article("Episode 12 en retard").category(), Category::Anime);
        assert_eq!(article("Le manga fait son retour").category(), Category::Manga);
        assert_eq!(article("Japan Expo 2025").category(), Category::News);
        // anime keywords win over manga
        assert_eq!(article("Le manga adapté en anime").category(), Category::Anime);
    }

    #[test]
    fn test_hash_is_stable_and_distinct() {
        let a = Article {
            title: "t".into(),
            link: "l".into(),
            date: "d".into(),
            thumbnail: None,
        };
        let mut b = a.clone();
        b.thumbnail = Some("x".into());

        assert_eq!(a.hash().len(), 64);
        assert_eq!(a.hash(), b.hash());

        b.date = "e".into();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_dominant_rgb() {
        let red = [255, 0, 0];
        let blue = [0, 0, 255];
        assert_eq!(dominant_rgb(vec![red, blue, blue, red, blue]), Some(blue));
        assert_eq!(dominant_rgb(vec![red, blue]), Some(red));
        assert_eq!(dominant_rgb(Vec::<[u8; 3]>::new()), None);
    }
}
